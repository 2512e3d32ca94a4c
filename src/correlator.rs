//! Sample-to-structure correlator and the normalization passes that
//! follow it. Walks every leaf of a CCT, maps its unrelocated instruction
//! pointer to the deepest enclosing static scope, and rebuilds the flat
//! call-site chain into nested `ProcedureFrame`/`Loop`/`Alien` nodes that
//! mirror the source-level call structure, including inlining.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::cct::node::{Cct, CctNode, NodeId};
use crate::core::loadmodule::Epoch;
use crate::core::vma::Vma;
use crate::location::LocationMgr;
use crate::structure::tree::{ScopeKind, StructureNode, StructureTree};

/// The static structure consulted for one used load module, plus the
/// attribution to fall back to when none is available.
pub struct ModuleStructure<'a> {
    pub lm_id: u32,
    pub module_name: String,
    pub tree: Option<&'a StructureTree>,
}

/// Runs the correlator over every dynamic leaf in `cct`, then its
/// normalization passes. `modules` need not be in any particular order;
/// they are internally sorted by descending `mapaddr` so later (lower,
/// more specific) modules don't get overlapped by earlier ones, using
/// `epoch` to look up each module's `mapaddr`.
pub fn correlate(cct: &mut Cct, epoch: &Epoch, modules: &[ModuleStructure]) {
    let Some(root) = cct.root() else { return };

    let mut ordered: Vec<&ModuleStructure> = modules.iter().collect();
    ordered.sort_by_key(|m| std::cmp::Reverse(epoch.find_by_id(m.lm_id).map(|lm| lm.mapaddr()).unwrap_or(0)));

    for module in ordered {
        info!("correlating load module {:?} (id {})", module.module_name, module.lm_id);
        match module.tree {
            Some(tree) => correlate_module(cct, root, module.lm_id, tree),
            None => correlate_module_fallback(cct, root, module.lm_id, &module.module_name),
        }
    }

    normalize(cct, root);
}

/// One static scope on the path from a module's structure root down to the
/// scope enclosing a sampled instruction, restricted to the kinds that
/// become CCT nodes: procedure/alien frames and loops.
struct PathEntry<'a> {
    node: &'a StructureNode,
}

/// Finds the root-to-leaf chain of scopes enclosing `vma`, restricted to
/// kinds that matter for CCT reconstruction. `File`/`Program`/`Group`/
/// `LoadModule` wrapper scopes are structural only and contribute no CCT
/// node.
fn structure_path(root: &StructureNode, vma: Vma) -> Vec<PathEntry<'_>> {
    let mut path = Vec::new();
    collect_path(root, vma, &mut path);
    path
}

fn collect_path<'a>(node: &'a StructureNode, vma: Vma, path: &mut Vec<PathEntry<'a>>) -> bool {
    if !node.vmas.is_empty() && !node.vmas.contains(vma) {
        return false;
    }
    let is_scope_kind = matches!(
        node.kind,
        ScopeKind::Proc | ScopeKind::Alien | ScopeKind::Loop | ScopeKind::Statement
    );
    if is_scope_kind {
        path.push(PathEntry { node });
    }
    for child in &node.children {
        if collect_path(child, vma, path) {
            return true;
        }
    }
    is_scope_kind || node.vmas.contains(vma)
}

/// Keys a synthesized CCT frame/loop by the physical parent it hangs off
/// and the static structure id it represents, so that sibling samples
/// sharing the same inlining/loop context reuse the same node.
type SynthCache = HashMap<(NodeId, u32), NodeId>;

fn correlate_module(cct: &mut Cct, root: NodeId, lm_id: u32, tree: &StructureTree) {
    let leaves: Vec<NodeId> = cct
        .preorder(root)
        .into_iter()
        .filter(|&id| matches!(cct.node(id), CctNode::Statement(d) if d.lm_id == Some(lm_id)))
        .collect();

    let mut pf_cache: SynthCache = HashMap::new();
    let mut loc_mgrs: HashMap<NodeId, LocationMgr> = HashMap::new();
    let mut missed = 0usize;

    for leaf in leaves {
        let vma = cct.node(leaf).dyn_data().unwrap().ip;
        let path = structure_path(&tree.root, vma);
        let Some(&last) = path.last().as_ref() else {
            missed += 1;
            continue;
        };
        let s = last.node;

        // c: nearest enclosing Proc/Alien scope (never the statement scope
        // itself).
        let c = path
            .iter()
            .rev()
            .map(|e| e.node)
            .find(|n| matches!(n.kind, ScopeKind::Proc | ScopeKind::Alien));

        let parent = cct.parent_of(leaf).unwrap();

        // Placement within the enclosing procedure (if any) is handed off
        // to a location manager kept alive per synthesized procedure
        // frame, so that the nested alien/loop chain for every sample of
        // the same procedure activation is built up incrementally, the
        // same way it would be driven from a stream of live samples.
        let attach_point = match path.iter().find(|e| e.node.kind == ScopeKind::Proc) {
            Some(proc_entry) => {
                let proc_entry = proc_entry.node;
                let proc_node = *pf_cache.entry((parent, proc_entry.structure_id)).or_insert_with(|| {
                    let frame = cct.alloc(CctNode::ProcedureFrame {
                        file: proc_entry.file.clone(),
                        proc: proc_entry.name.clone(),
                        is_alien: false,
                        line: proc_entry.beg_line,
                        file_is_text: true,
                    });
                    cct.append_child(parent, frame);
                    frame
                });
                let mgr = loc_mgrs.entry(proc_node).or_insert_with(|| {
                    let mut mgr = LocationMgr::new();
                    mgr.beg_seq(
                        proc_node,
                        proc_entry.file.clone(),
                        proc_entry.name.clone(),
                        proc_entry.beg_line,
                        proc_entry.end_line,
                        proc_entry.structure_id,
                    );
                    mgr
                });

                for entry in path.iter().filter(|e| matches!(e.node.kind, ScopeKind::Alien | ScopeKind::Loop)) {
                    let n = entry.node;
                    match n.kind {
                        ScopeKind::Alien => {
                            mgr.note_alien_scope(
                                cct,
                                n.file.as_deref().unwrap_or(Path::new("")),
                                n.name.clone(),
                                n.beg_line,
                                n.end_line,
                                n.structure_id,
                            );
                        }
                        ScopeKind::Loop => {
                            mgr.locate_loop(
                                cct,
                                n.file.as_deref().unwrap_or(Path::new("")),
                                n.beg_line,
                                n.end_line,
                                n.structure_id,
                            );
                        }
                        _ => unreachable!(),
                    }
                }
                mgr.current_node()
            }
            None => parent,
        };

        cct.unlink(leaf);
        cct.append_child(attach_point, leaf);
        if let Some(d) = cct.node_mut(leaf).dyn_data_mut() {
            match c {
                Some(c) => {
                    d.file = c.file.clone();
                    d.proc = c.name.clone();
                    d.line = s.beg_line;
                    d.file_is_text = true;
                    d.structure_id = Some(s.structure_id);
                }
                None => {
                    d.file = None;
                    d.line = 0;
                    d.file_is_text = false;
                    d.structure_id = Some(tree.root.structure_id);
                }
            }
        }
    }

    if missed > 0 {
        debug!("{} sample(s) in load module {} fell outside all known static structure", missed, lm_id);
    }
}

/// No static structure tree is available for this module, so frames are
/// keyed by `(file, proc)` rather than reconstructed loop nests, and the
/// line attributed is just the module's name with `fileIsText = false` —
/// a soft correlation miss, not a hard failure.
fn correlate_module_fallback(cct: &mut Cct, root: NodeId, lm_id: u32, module_name: &str) {
    let leaves: Vec<NodeId> = cct
        .preorder(root)
        .into_iter()
        .filter(|&id| matches!(cct.node(id), CctNode::Statement(d) if d.lm_id == Some(lm_id)))
        .collect();
    warn!(
        "no static structure for load module {:?} ({} sample(s)); attributing to the load module only",
        module_name,
        leaves.len()
    );
    for leaf in leaves {
        if let Some(d) = cct.node_mut(leaf).dyn_data_mut() {
            d.file = Some(PathBuf::from(module_name));
            d.proc = None;
            d.line = 0;
            d.file_is_text = false;
            d.structure_id = Some(lm_id);
        }
    }
}

// ---------------------------------------------------------------------
// Normalization after correlation
// ---------------------------------------------------------------------

fn normalize(cct: &mut Cct, root: NodeId) {
    loop {
        let mut changed = merge_perfectly_nested_loops(cct, root);
        changed |= merge_sibling_loops(cct, root);
        changed |= coalesce_duplicate_siblings(cct, root);
        if !changed {
            break;
        }
    }
    remove_bogus_alien_frames(cct, root);
    remove_empty_nodes(cct, root);
}

fn loop_bounds(node: &CctNode) -> Option<(Option<&PathBuf>, u32, u32)> {
    match node {
        CctNode::Loop { file, beg_line, end_line } => Some((file.as_ref(), *beg_line, *end_line)),
        _ => None,
    }
}

/// Merges a `Loop` into its sole child `Loop` when both cover the same
/// file and line range — the perfectly-nested case that arises when
/// structure recovery (or two independent samples of the same unrolled
/// loop) produces redundant nesting.
fn merge_perfectly_nested_loops(cct: &mut Cct, start: NodeId) -> bool {
    let mut changed = false;
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        if cct.children_of(id).len() == 1 {
            let only_child = cct.children_of(id)[0];
            if let (Some(outer), Some(inner)) = (loop_bounds(cct.node(id)), loop_bounds(cct.node(only_child))) {
                if outer == inner {
                    let grandchildren = cct.children_of(only_child).to_vec();
                    cct.unlink(only_child);
                    for gc in grandchildren {
                        cct.unlink(gc);
                        cct.append_child(id, gc);
                    }
                    changed = true;
                    stack.push(id);
                    continue;
                }
            }
        }
        stack.extend(cct.children_of(id).iter().copied());
    }
    changed
}

/// Merges sibling `Loop` nodes under the same parent that cover the same
/// file and line range — the loop-unrolling case, where either the
/// compiler or independent samples of the same unrolled copy produce more
/// than one loop scope for what is structurally one source loop.
fn merge_sibling_loops(cct: &mut Cct, start: NodeId) -> bool {
    let mut changed = false;
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        let children = cct.children_of(id).to_vec();
        let mut kept: Vec<NodeId> = Vec::new();
        for child in children {
            let Some((file, beg, end)) = loop_bounds(cct.node(child)).map(|(f, b, e)| (f.cloned(), b, e)) else {
                stack.push(child);
                continue;
            };
            let dup = kept
                .iter()
                .copied()
                .find(|&k| loop_bounds(cct.node(k)).map(|(f, b, e)| (f.cloned(), b, e)) == Some((file.clone(), beg, end)));
            match dup {
                Some(keep) => {
                    let grandchildren = cct.children_of(child).to_vec();
                    cct.unlink(child);
                    for gc in grandchildren {
                        cct.unlink(gc);
                        cct.append_child(keep, gc);
                    }
                    changed = true;
                }
                None => {
                    kept.push(child);
                    stack.push(child);
                }
            }
        }
    }
    changed
}

fn stmt_key(node: &CctNode) -> Option<(Option<PathBuf>, Option<String>, u32)> {
    match node {
        CctNode::Statement(d) => Some((d.file.clone(), d.proc.clone(), d.line)),
        _ => None,
    }
}

/// Merges `Statement` siblings sharing `(file, proc, line)`: metrics summed,
/// the duplicate removed, so that no two `Statement` siblings share the
/// same source attribution after normalization.
fn coalesce_duplicate_siblings(cct: &mut Cct, start: NodeId) -> bool {
    let mut changed = false;
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        let children = cct.children_of(id).to_vec();
        let mut seen: HashMap<(Option<PathBuf>, Option<String>, u32), NodeId> = HashMap::new();
        for &child in &children {
            let Some(key) = stmt_key(cct.node(child)) else {
                stack.push(child);
                continue;
            };
            match seen.get(&key) {
                Some(&kept) => {
                    let dup_metrics = cct.node(child).dyn_data().unwrap().metrics.clone();
                    if let Some(d) = cct.node_mut(kept).dyn_data_mut() {
                        for (slot, v) in d.metrics.iter_mut().zip(dup_metrics.iter()) {
                            *slot += v;
                        }
                    }
                    cct.unlink(child);
                    changed = true;
                }
                None => {
                    seen.insert(key, child);
                }
            }
        }
    }
    changed
}

fn is_fuzzy_name_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.to_ascii_lowercase(), b.to_ascii_lowercase());
    a == b || a.contains(&b) || b.contains(&a)
}

/// Removes an alien `ProcedureFrame` whose filename matches its enclosing
/// procedure's own filename and whose name fuzzily matches too (case-
/// insensitive substring), folding its children into the parent — a
/// spurious inlining frame produced when debug info attributes a few
/// instructions to a "different" context that's actually the same
/// procedure.
fn remove_bogus_alien_frames(cct: &mut Cct, start: NodeId) {
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        let children = cct.children_of(id).to_vec();
        for &child in &children {
            if is_bogus_alien(cct, id, child) {
                let grandchildren = cct.children_of(child).to_vec();
                cct.unlink(child);
                for gc in grandchildren {
                    cct.unlink(gc);
                    cct.append_child(id, gc);
                }
                stack.push(id);
                continue;
            }
            stack.push(child);
        }
    }
}

fn is_bogus_alien(cct: &Cct, parent: NodeId, child: NodeId) -> bool {
    let (CctNode::ProcedureFrame { file: child_file, proc: child_proc, is_alien: true, .. }, parent_node) =
        (cct.node(child), cct.node(parent))
    else {
        return false;
    };
    let CctNode::ProcedureFrame { file: parent_file, proc: parent_proc, .. } = parent_node else {
        return false;
    };
    let same_file = match (child_file, parent_file) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    let name_match = match (child_proc, parent_proc) {
        (Some(a), Some(b)) => is_fuzzy_name_match(a, b),
        _ => true,
    };
    same_file && name_match
}

/// Removes empty structural nodes bottom-up: files, procedure frames, and
/// loops with no children. The `Pgm` root is never removed.
fn remove_empty_nodes(cct: &mut Cct, start: NodeId) {
    let children = cct.children_of(start).to_vec();
    for child in children {
        remove_empty_nodes(cct, child);
    }
    if Some(start) == cct.root() {
        return;
    }
    let removable = matches!(cct.node(start), CctNode::ProcedureFrame { .. } | CctNode::Loop { .. } | CctNode::StmtRange { .. } | CctNode::Group { .. });
    if removable && cct.children_of(start).is_empty() {
        cct.unlink(start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cct::node::{AssocClass, DynNodeData};
    use crate::structure::vma_interval::VmaInterval;

    fn stmt(ip: Vma, lm_id: u32, metric: f64) -> CctNode {
        let mut d = DynNodeData::new(ip, 0, AssocClass::Direct, 0, vec![metric]);
        d.lm_id = Some(lm_id);
        CctNode::Statement(d)
    }

    fn build_tree_with_one_leaf(ip: Vma, lm_id: u32) -> (Cct, NodeId, NodeId) {
        let mut cct = Cct::new();
        let root = cct.alloc(CctNode::Pgm { name: "a.out".into(), frozen: true });
        cct.set_root(root);
        let leaf = cct.alloc(stmt(ip, lm_id, 1.0));
        cct.append_child(root, leaf);
        (cct, root, leaf)
    }

    fn minimal_structure() -> StructureTree {
        let mut stmt = StructureNode::new(ScopeKind::Statement, 2).with_lines(15, 15);
        stmt.vmas.insert(VmaInterval::new(0x1010, 0x1020));
        let mut proc = StructureNode::new(ScopeKind::Proc, 1)
            .with_name("main")
            .with_file("a.c")
            .with_lines(10, 30);
        proc.vmas.insert(VmaInterval::new(0x1000, 0x1030));
        proc.children.push(stmt);
        StructureTree { load_module_name: "a.out".into(), root: proc }
    }

    #[test]
    fn scenario_1_minimal_attribution() {
        let (mut cct, root, leaf) = build_tree_with_one_leaf(0x1015, 0);
        let tree = minimal_structure();
        correlate_module(&mut cct, root, 0, &tree);

        // leaf should have been relinked under a PF(main) frame.
        let pf = cct.children_of(root)[0];
        match cct.node(pf) {
            CctNode::ProcedureFrame { proc, file, is_alien, .. } => {
                assert_eq!(proc.as_deref(), Some("main"));
                assert_eq!(file.as_deref(), Some(Path::new("a.c")));
                assert!(!is_alien);
            }
            other => panic!("expected PF, got {other:?}"),
        }
        let relinked_leaf = cct.children_of(pf)[0];
        let d = cct.node(relinked_leaf).dyn_data().unwrap();
        assert_eq!(d.line, 15);
        assert!(d.file_is_text);
        let _ = leaf;
    }

    #[test]
    fn scenario_2_inlined_frame() {
        let mut stmt_scope = StructureNode::new(ScopeKind::Statement, 3).with_lines(9, 9);
        stmt_scope.vmas.insert(VmaInterval::new(0x2000, 0x2010));
        let mut alien = StructureNode::new(ScopeKind::Alien, 2)
            .with_name("foo")
            .with_file("foo.h")
            .with_lines(7, 7);
        alien.vmas.insert(VmaInterval::new(0x2000, 0x2010));
        alien.children.push(stmt_scope);
        let mut proc = StructureNode::new(ScopeKind::Proc, 1)
            .with_name("main")
            .with_file("a.c")
            .with_lines(40, 50);
        proc.vmas.insert(VmaInterval::new(0x2000, 0x2020));
        proc.children.push(alien);
        let tree = StructureTree { load_module_name: "a.out".into(), root: proc };

        let (mut cct, root, _) = build_tree_with_one_leaf(0x2005, 0);
        correlate_module(&mut cct, root, 0, &tree);

        let pf_main = cct.children_of(root)[0];
        let pf_foo = cct.children_of(pf_main)[0];
        match cct.node(pf_foo) {
            CctNode::ProcedureFrame { proc, file, is_alien, .. } => {
                assert_eq!(proc.as_deref(), Some("foo"));
                assert_eq!(file.as_deref(), Some(Path::new("foo.h")));
                assert!(*is_alien);
            }
            other => panic!("expected alien PF, got {other:?}"),
        }
        let s = cct.children_of(pf_foo)[0];
        assert_eq!(cct.node(s).dyn_data().unwrap().line, 9);
    }

    #[test]
    fn scenario_4_loop_unrolling_merges_and_coalesces() {
        let mut cct = Cct::new();
        let root = cct.alloc(CctNode::Pgm { name: "a.out".into(), frozen: true });
        cct.set_root(root);
        let pf = cct.alloc(CctNode::ProcedureFrame {
            file: Some("bar.c".into()),
            proc: Some("bar".into()),
            is_alien: false,
            line: 45,
            file_is_text: true,
        });
        cct.append_child(root, pf);

        let loop_a = cct.alloc(CctNode::Loop { file: Some("bar.c".into()), beg_line: 48, end_line: 55 });
        let loop_b = cct.alloc(CctNode::Loop { file: Some("bar.c".into()), beg_line: 48, end_line: 55 });
        cct.append_child(pf, loop_a);
        cct.append_child(pf, loop_b);

        let mut d1 = DynNodeData::new(0x10, 0, AssocClass::Direct, 0, vec![1.0]);
        d1.file = Some("bar.c".into());
        d1.proc = Some("bar".into());
        d1.line = 50;
        let s1 = cct.alloc(CctNode::Statement(d1));
        cct.append_child(loop_a, s1);

        let mut d2 = DynNodeData::new(0x20, 0, AssocClass::Direct, 0, vec![2.0]);
        d2.file = Some("bar.c".into());
        d2.proc = Some("bar".into());
        d2.line = 50;
        let s2 = cct.alloc(CctNode::Statement(d2));
        cct.append_child(loop_b, s2);

        normalize(&mut cct, root);

        // the two loops should have merged into one, and its two statement
        // children coalesced into one with summed metrics.
        assert_eq!(cct.children_of(pf).len(), 1, "loops with identical bounds should merge");
        let merged_loop = cct.children_of(pf)[0];
        assert_eq!(cct.children_of(merged_loop).len(), 1, "duplicate statements should coalesce");
        let only_stmt = cct.children_of(merged_loop)[0];
        assert_eq!(cct.node(only_stmt).dyn_data().unwrap().metrics, vec![3.0]);
    }

    #[test]
    fn removes_empty_frames_but_keeps_the_root() {
        let mut cct = Cct::new();
        let root = cct.alloc(CctNode::Pgm { name: "a.out".into(), frozen: true });
        cct.set_root(root);
        let empty_pf = cct.alloc(CctNode::ProcedureFrame {
            file: None,
            proc: Some("dead".into()),
            is_alien: false,
            line: 0,
            file_is_text: false,
        });
        cct.append_child(root, empty_pf);

        remove_empty_nodes(&mut cct, root);

        assert!(cct.children_of(root).is_empty());
        assert_eq!(cct.root(), Some(root));
    }
}
