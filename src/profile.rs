//! The profile object: owns a calling-context tree, its metric
//! descriptors, and the epoch it was sampled under. This is the
//! top-level handle everything else in the correlator is threaded
//! through.

use log::{debug, info};

use crate::cct::merge::merge_trees;
use crate::cct::node::Cct;
use crate::core::loadmodule::Epoch;
use crate::core::metric::MetricDescriptor;

/// How per-thread calling contexts are joined when merging multiple
/// sampled profiles into one. Exposed as a runtime option rather than a
/// compile-time flag so a single build can serve either policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadAttachMode {
    /// Each profile file keeps its own subtree under the program root,
    /// grouped by thread/process (`G` nodes).
    Separate,
    /// All profile files are merged directly into one shared call tree,
    /// with matching calling contexts from different threads collapsed
    /// into a single node whose metrics are summed rather than
    /// concatenated.
    #[default]
    Combined,
}

/// A single loaded profile: a CCT plus the metric descriptors and epoch it
/// was sampled under.
pub struct Profile {
    pub name: String,
    pub metrics: Vec<MetricDescriptor>,
    pub epoch: Epoch,
    pub cct: Cct,
}

impl Profile {
    pub fn new(name: String, metrics: Vec<MetricDescriptor>, epoch: Epoch, cct: Cct) -> Self {
        Profile {
            name,
            metrics,
            epoch,
            cct,
        }
    }

    pub fn num_metrics(&self) -> usize {
        self.metrics.len()
    }

    /// Merges `other` into `self`: `self` keeps its shape, `other`'s
    /// metric descriptors are appended after `self`'s, and every node's
    /// metric vector grows to `self.num_metrics() + other.num_metrics()`.
    /// `other` is consumed by the merge.
    pub fn merge(&mut self, other: Profile) {
        let x_num = self.num_metrics();
        let y_num = other.num_metrics();
        info!(
            "merging profile {:?} ({} metric(s)) into {:?} ({} metric(s))",
            other.name, y_num, self.name, x_num
        );
        merge_trees(&mut self.cct, &other.cct, x_num, y_num);
        self.metrics.extend(other.metrics);
        debug!("merged profile now has {} metric column(s)", self.num_metrics());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cct::node::{AssocClass, CctNode, DynNodeData};
    use std::path::Path;

    fn one_sample_profile(name: &str, ip: u64, metric_name: &str, value: f64) -> Profile {
        let mut cct = Cct::new();
        let root = cct.alloc(CctNode::Pgm {
            name: "a.out".into(),
            frozen: false,
        });
        cct.set_root(root);
        let leaf = cct.alloc(CctNode::CallSite(DynNodeData::new(
            ip,
            0,
            AssocClass::Direct,
            0,
            vec![value],
        )));
        cct.append_child(root, leaf);

        Profile::new(
            name.into(),
            vec![MetricDescriptor::new(metric_name, 0, 1)],
            Epoch::new(vec![("a.out".into(), 0x400000, 0x400000)], Path::new("a.out")),
            cct,
        )
    }

    #[test]
    fn merge_concatenates_metric_descriptors_and_columns() {
        let mut p0 = one_sample_profile("t0", 0x10, "CYCLES", 1.0);
        let p1 = one_sample_profile("t1", 0x10, "CYCLES", 2.0);

        p0.merge(p1);

        assert_eq!(p0.metrics.len(), 2);
        let root = p0.cct.root().unwrap();
        let leaf = p0.cct.children_of(root)[0];
        assert_eq!(p0.cct.node(leaf).dyn_data().unwrap().metrics, vec![1.0, 2.0]);
    }

    #[test]
    fn merge_is_idempotent_with_an_empty_zero_metric_profile() {
        let mut p0 = one_sample_profile("t0", 0x10, "CYCLES", 1.0);
        let before = p0.cct.preorder(p0.cct.root().unwrap()).len();

        let empty = Profile::new(
            "empty".into(),
            Vec::new(),
            Epoch::new(vec![], Path::new("a.out")),
            {
                let mut cct = Cct::new();
                let root = cct.alloc(CctNode::Pgm {
                    name: "a.out".into(),
                    frozen: false,
                });
                cct.set_root(root);
                cct
            },
        );
        p0.merge(empty);

        assert_eq!(p0.cct.preorder(p0.cct.root().unwrap()).len(), before);
        let root = p0.cct.root().unwrap();
        let leaf = p0.cct.children_of(root)[0];
        assert_eq!(p0.cct.node(leaf).dyn_data().unwrap().metrics, vec![1.0]);
    }
}
