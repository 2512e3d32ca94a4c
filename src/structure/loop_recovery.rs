//! Loop-nest recovery over a control-flow graph: interval analysis used
//! to recover natural loops and their nesting when the static structure a
//! debug-info pass produced is incomplete. This module works over an
//! abstract CFG of basic-block ids; callers translate structure-file or
//! disassembly information into that form.

use std::collections::{BTreeMap, BTreeSet, HashMap};

pub type BlockId = u32;

/// A control-flow graph: a single entry block and a successor relation.
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    pub entry: BlockId,
    successors: BTreeMap<BlockId, Vec<BlockId>>,
}

impl ControlFlowGraph {
    pub fn new(entry: BlockId) -> Self {
        ControlFlowGraph {
            entry,
            successors: BTreeMap::new(),
        }
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.successors.entry(from).or_default().push(to);
        self.successors.entry(to).or_default();
        self.successors.entry(from).or_default();
    }

    fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.successors.keys().copied()
    }

    fn succs(&self, b: BlockId) -> &[BlockId] {
        self.successors.get(&b).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn preds(&self, target: BlockId) -> Vec<BlockId> {
        self.successors
            .iter()
            .filter(|(_, outs)| outs.contains(&target))
            .map(|(n, _)| *n)
            .collect()
    }
}

/// A natural loop: the header block plus every block in its body, and the
/// set of loops nested immediately inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopRegion {
    pub header: BlockId,
    pub body: BTreeSet<BlockId>,
    pub children: Vec<LoopRegion>,
}

/// Computes the immediate-dominator map of a CFG via the classic iterative
/// dataflow fixpoint (Cooper, Harvey & Kennedy's engineered algorithm is
/// faster, but this converges the same dominator sets and is far easier to
/// read correctly).
fn dominators(cfg: &ControlFlowGraph) -> HashMap<BlockId, BTreeSet<BlockId>> {
    let all: BTreeSet<BlockId> = cfg.blocks().collect();
    let mut dom: HashMap<BlockId, BTreeSet<BlockId>> = all
        .iter()
        .map(|&b| {
            let set = if b == cfg.entry {
                BTreeSet::from([b])
            } else {
                all.clone()
            };
            (b, set)
        })
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for &b in &all {
            if b == cfg.entry {
                continue;
            }
            let preds = cfg.preds(b);
            let new_set = preds
                .iter()
                .map(|p| dom[p].clone())
                .reduce(|acc, s| acc.intersection(&s).copied().collect())
                .unwrap_or_default();
            let mut new_set = new_set;
            new_set.insert(b);
            if new_set != dom[&b] {
                dom.insert(b, new_set);
                changed = true;
            }
        }
    }
    dom
}

/// Recovers the set of top-level natural loops (and their nesting) in
/// `cfg`. A back edge `n -> h` exists whenever `h` dominates `n`; the
/// natural loop of that back edge is `h` plus every block that can reach
/// `n` without passing through `h`.
pub fn recover_loops(cfg: &ControlFlowGraph) -> Vec<LoopRegion> {
    let dom = dominators(cfg);

    let mut loops_by_header: BTreeMap<BlockId, BTreeSet<BlockId>> = BTreeMap::new();
    for n in cfg.blocks() {
        for &succ in cfg.succs(n) {
            let h = succ;
            if dom.get(&n).map(|d| d.contains(&h)).unwrap_or(false) {
                let body = natural_loop_body(cfg, h, n);
                loops_by_header.entry(h).or_default().extend(body);
            }
        }
    }

    nest_loops(loops_by_header)
}

fn natural_loop_body(cfg: &ControlFlowGraph, header: BlockId, tail: BlockId) -> BTreeSet<BlockId> {
    let mut body = BTreeSet::from([header]);
    let mut stack = vec![tail];
    body.insert(tail);
    while let Some(n) = stack.pop() {
        for p in cfg.preds(n) {
            if body.insert(p) {
                stack.push(p);
            }
        }
    }
    body
}

/// Builds a forest from a header->body map by nesting each loop inside the
/// smallest other loop whose body strictly contains it.
fn nest_loops(loops_by_header: BTreeMap<BlockId, BTreeSet<BlockId>>) -> Vec<LoopRegion> {
    let mut regions: Vec<LoopRegion> = loops_by_header
        .into_iter()
        .map(|(header, body)| LoopRegion {
            header,
            body,
            children: Vec::new(),
        })
        .collect();
    // Outermost (largest body) first, so each loop is attached to the
    // tightest already-placed enclosing loop as children are filled in.
    regions.sort_by_key(|r| std::cmp::Reverse(r.body.len()));

    let mut roots: Vec<LoopRegion> = Vec::new();
    'outer: for region in regions {
        // Try to nest into any existing root (recursively), else it's a root.
        for root in roots.iter_mut() {
            if try_nest(root, region.clone()) {
                continue 'outer;
            }
        }
        roots.push(region);
    }
    roots
}

fn try_nest(parent: &mut LoopRegion, candidate: LoopRegion) -> bool {
    if candidate.header == parent.header || !parent.body.is_superset(&candidate.body) {
        return false;
    }
    for child in parent.children.iter_mut() {
        if try_nest(child, candidate.clone()) {
            return true;
        }
    }
    parent.children.push(candidate);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    // Outer loop header 1 (body {1,2,3,4}), inner loop header 2 (body {2,3}).
    fn nested_loop_cfg() -> ControlFlowGraph {
        let mut cfg = ControlFlowGraph::new(0);
        cfg.add_edge(0, 1);
        cfg.add_edge(1, 2);
        cfg.add_edge(2, 3);
        cfg.add_edge(3, 2); // inner back edge, header 2
        cfg.add_edge(2, 4);
        cfg.add_edge(4, 1); // outer back edge, header 1
        cfg.add_edge(1, 5);
        cfg
    }

    #[test]
    fn recovers_single_loop() {
        let mut cfg = ControlFlowGraph::new(0);
        cfg.add_edge(0, 1);
        cfg.add_edge(1, 2);
        cfg.add_edge(2, 1);
        cfg.add_edge(1, 3);
        let loops = recover_loops(&cfg);
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].header, 1);
        assert_eq!(loops[0].body, BTreeSet::from([1, 2]));
    }

    #[test]
    fn nests_inner_loop_inside_outer() {
        let cfg = nested_loop_cfg();
        let loops = recover_loops(&cfg);
        assert_eq!(loops.len(), 1, "one top-level loop, with the other nested inside it");
        let outer = &loops[0];
        assert_eq!(outer.header, 1);
        assert_eq!(outer.body, BTreeSet::from([1, 2, 3, 4]));
        assert_eq!(outer.children.len(), 1);
        assert_eq!(outer.children[0].header, 2);
        assert_eq!(outer.children[0].body, BTreeSet::from([2, 3]));
    }

    #[test]
    fn acyclic_graph_has_no_loops() {
        let mut cfg = ControlFlowGraph::new(0);
        cfg.add_edge(0, 1);
        cfg.add_edge(1, 2);
        assert!(recover_loops(&cfg).is_empty());
    }
}
