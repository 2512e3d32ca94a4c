//! Runtime insertion of a single sampled backtrace into a calling-context
//! tree: the in-process path a sampler would walk into on every signal,
//! plus a finalize hook run once a backtrace has been inserted (e.g. to
//! fix up a logical/physical split). The correlator itself never calls
//! this directly — it's the shape the sampling side of the system would
//! drive the CCT through — but the CCT must support it so a sampler can
//! build against this crate.

use crate::cct::node::{AssocClass, Cct, CctNode, DynNodeData, NodeId};
use crate::core::vma::Vma;

/// A hook run after a backtrace has been inserted, given the path from
/// root to the new leaf (outermost frame first).
pub type FinalizeHook = Box<dyn Fn(&mut Cct, &[NodeId])>;

/// One stack frame as handed to the inserter by a sampler: an operation
/// pointer plus whatever metric values this sample contributes.
#[derive(Debug, Clone)]
pub struct SampledFrame {
    pub op_ip: Vma,
    pub op_index: u16,
}

/// Inserts sampled backtraces into one calling-context tree, caching the
/// most recently inserted path so that repeated samples along the same
/// call stack (the common case for a tight loop) don't need to re-walk
/// from the root — the "trampoline" in `cct_insert_backtrace.c`.
pub struct BacktraceInserter {
    finalizers: Vec<FinalizeHook>,
    last_path: Vec<(Vma, u16, NodeId)>,
}

impl BacktraceInserter {
    pub fn new() -> Self {
        BacktraceInserter {
            finalizers: Vec::new(),
            last_path: Vec::new(),
        }
    }

    pub fn register_finalizer(&mut self, hook: FinalizeHook) {
        self.finalizers.push(hook);
    }

    /// Inserts `frames` (outermost caller first, innermost/leaf last) under
    /// `root`, reusing as much of the previously inserted path as matches.
    /// `incomplete` marks a backtrace that was truncated before reaching a
    /// recognizable root frame (a partial unwind). `metrics` is the sample
    /// applied to the leaf frame only (each node carries its own
    /// per-node metric vector; intermediate frames in a chain accrue
    /// metrics only when they're themselves sampled as a leaf in some
    /// other backtrace).
    pub fn insert(
        &mut self,
        cct: &mut Cct,
        root: NodeId,
        frames: &[SampledFrame],
        metrics: Vec<f64>,
        incomplete: bool,
    ) -> NodeId {
        let mut common = 0;
        while common < frames.len()
            && common < self.last_path.len()
            && self.last_path[common].0 == frames[common].op_ip
            && self.last_path[common].1 == frames[common].op_index
        {
            common += 1;
        }

        let mut cursor = if common == 0 {
            root
        } else {
            self.last_path[common - 1].2
        };
        self.last_path.truncate(common);

        for frame in &frames[common..] {
            cursor = self.find_or_create_child(cct, cursor, frame);
            self.last_path.push((frame.op_ip, frame.op_index, cursor));
        }

        if let Some(leaf) = frames.last() {
            let _ = leaf;
            if let Some(d) = cct.node_mut(cursor).dyn_data_mut() {
                if d.metrics.is_empty() {
                    d.metrics = metrics.clone();
                } else {
                    for (slot, v) in d.metrics.iter_mut().zip(metrics.iter()) {
                        *slot += v;
                    }
                }
                d.incomplete = incomplete;
            }
        }

        let path: Vec<NodeId> = self.last_path.iter().map(|(_, _, id)| *id).collect();
        for hook in &self.finalizers {
            hook(cct, &path);
        }

        cursor
    }

    fn find_or_create_child(&self, cct: &mut Cct, parent: NodeId, frame: &SampledFrame) -> NodeId {
        if let Some(&existing) = cct.children_of(parent).iter().find(|&&c| {
            matches!(cct.node(c), CctNode::CallSite(d) if d.ip == frame.op_ip && d.op_index == frame.op_index)
        }) {
            return existing;
        }
        let node = CctNode::CallSite(DynNodeData::new(
            frame.op_ip,
            frame.op_index,
            AssocClass::Direct,
            0,
            Vec::new(),
        ));
        let id = cct.alloc(node);
        cct.append_child(parent, id);
        id
    }
}

impl Default for BacktraceInserter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pgm_root(cct: &mut Cct) -> NodeId {
        let r = cct.alloc(CctNode::Pgm {
            name: "a.out".into(),
            frozen: false,
        });
        cct.set_root(r);
        r
    }

    #[test]
    fn repeated_backtrace_reuses_nodes_and_accumulates_metrics() {
        let mut cct = Cct::new();
        let root = pgm_root(&mut cct);
        let mut inserter = BacktraceInserter::new();

        let frames = vec![
            SampledFrame { op_ip: 0x10, op_index: 0 },
            SampledFrame { op_ip: 0x20, op_index: 0 },
        ];
        let leaf1 = inserter.insert(&mut cct, root, &frames, vec![1.0], false);
        let leaf2 = inserter.insert(&mut cct, root, &frames, vec![1.0], false);

        assert_eq!(leaf1, leaf2, "identical backtraces must collapse to one node");
        assert_eq!(cct.node(leaf1).dyn_data().unwrap().metrics, vec![2.0]);
        // only one call-site chain should exist under root
        assert_eq!(cct.children_of(root).len(), 1);
    }

    #[test]
    fn diverging_backtrace_branches_at_the_common_prefix() {
        let mut cct = Cct::new();
        let root = pgm_root(&mut cct);
        let mut inserter = BacktraceInserter::new();

        let common = SampledFrame { op_ip: 0x10, op_index: 0 };
        let a = vec![common.clone(), SampledFrame { op_ip: 0x20, op_index: 0 }];
        let b = vec![common, SampledFrame { op_ip: 0x30, op_index: 0 }];

        inserter.insert(&mut cct, root, &a, vec![1.0], false);
        inserter.insert(&mut cct, root, &b, vec![1.0], false);

        let shared = cct.children_of(root)[0];
        assert_eq!(cct.children_of(shared).len(), 2, "should branch, not duplicate the shared prefix");
    }

    #[test]
    fn incomplete_unwind_marks_the_leaf() {
        let mut cct = Cct::new();
        let root = pgm_root(&mut cct);
        let mut inserter = BacktraceInserter::new();
        let frames = vec![SampledFrame { op_ip: 0x10, op_index: 0 }];
        let leaf = inserter.insert(&mut cct, root, &frames, vec![1.0], true);
        assert!(cct.node(leaf).dyn_data().unwrap().incomplete);
    }
}
