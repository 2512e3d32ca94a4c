//! Merging two calling-context trees.
//!
//! Two samples describe the same calling context exactly when their node
//! chains match by the merge identity key at every level: for a dynamic
//! (call-site/statement) node that's `(assoc-class, unrelocated ip,
//! logical ip)`; for a structural node it's the node's own identifying
//! fields (name, file, line range). Matching nodes have their metric
//! vectors concatenated (column-wise, since the two trees being merged
//! come from independent profiling runs with independent metric sets);
//! non-matching subtrees are cloned wholesale into the destination arena.

use crate::cct::node::{Cct, CctNode, NodeId};

#[derive(Debug, Clone, PartialEq)]
enum StructKey {
    Pgm,
    Group(String),
    ProcedureFrame {
        file: Option<std::path::PathBuf>,
        proc: Option<String>,
        is_alien: bool,
        line: u32,
        file_is_text: bool,
    },
    Loop {
        file: Option<std::path::PathBuf>,
        beg_line: u32,
        end_line: u32,
    },
    StmtRange {
        file: Option<std::path::PathBuf>,
        beg_line: u32,
        end_line: u32,
    },
    Dyn((crate::cct::node::AssocClass, crate::core::vma::Vma, u64)),
}

fn struct_key(node: &CctNode) -> StructKey {
    match node {
        CctNode::Pgm { .. } => StructKey::Pgm,
        CctNode::Group { name } => StructKey::Group(name.clone()),
        CctNode::ProcedureFrame {
            file,
            proc,
            is_alien,
            line,
            file_is_text,
        } => StructKey::ProcedureFrame {
            file: file.clone(),
            proc: proc.clone(),
            is_alien: *is_alien,
            line: *line,
            file_is_text: *file_is_text,
        },
        CctNode::Loop {
            file,
            beg_line,
            end_line,
        } => StructKey::Loop {
            file: file.clone(),
            beg_line: *beg_line,
            end_line: *end_line,
        },
        CctNode::StmtRange {
            file,
            beg_line,
            end_line,
        } => StructKey::StmtRange {
            file: file.clone(),
            beg_line: *beg_line,
            end_line: *end_line,
        },
        CctNode::CallSite(d) | CctNode::Statement(d) => StructKey::Dyn(d.merge_key()),
    }
}

/// Clones `id` (and everything beneath it) from `src` into `dst`, padding
/// every dynamic node's metric vector with `prefix_zeros` leading zero
/// columns — the cloned subtree came from a profile that had no data for
/// `dst`'s pre-existing metrics.
fn clone_subtree(dst: &mut Cct, src: &Cct, id: NodeId, prefix_zeros: usize) -> NodeId {
    let mut node = src.node(id).clone();
    if let Some(d) = node.dyn_data_mut() {
        let mut metrics = vec![0.0; prefix_zeros];
        metrics.extend_from_slice(&d.metrics);
        d.metrics = metrics;
    }
    let new_id = dst.alloc(node);
    for &child in src.children_of(id) {
        let new_child = clone_subtree(dst, src, child, prefix_zeros);
        dst.append_child(new_id, new_child);
    }
    new_id
}

/// Appends `suffix_zeros` trailing zero columns to every dynamic node's
/// metric vector in the subtree rooted at `id` — this subtree was kept
/// from `dst`'s own tree and has no data for the metrics the incoming
/// profile is about to contribute.
fn pad_existing_subtree(dst: &mut Cct, id: NodeId, suffix_zeros: usize) {
    if suffix_zeros == 0 {
        return;
    }
    let children = dst.children_of(id).to_vec();
    if let Some(d) = dst.node_mut(id).dyn_data_mut() {
        d.metrics.extend(std::iter::repeat(0.0).take(suffix_zeros));
    }
    for child in children {
        pad_existing_subtree(dst, child, suffix_zeros);
    }
}

/// Merges the subtree rooted at `y_id` (in `y`) into the subtree rooted at
/// `x_id` (in `x`), which is mutated in place. `x_num_metrics`/
/// `y_num_metrics` are the pre-merge metric column counts of each side,
/// used to align columns: `x`'s existing nodes gain `y_num_metrics` zero
/// columns at the end; nodes newly brought in from `y` gain
/// `x_num_metrics` zero columns at the start. Runs in
/// `O(|y| * max-fanout(x))`: for every node of `y` we do a linear scan of
/// its merge-candidate's existing children in `x`.
pub fn merge(
    x: &mut Cct,
    x_id: NodeId,
    y: &Cct,
    y_id: NodeId,
    x_num_metrics: usize,
    y_num_metrics: usize,
) {
    let mut matched: Vec<NodeId> = Vec::new();

    for &y_child in y.children_of(y_id) {
        let y_key = struct_key(y.node(y_child));
        let existing = x
            .children_of(x_id)
            .iter()
            .copied()
            .find(|&xc| !matched.contains(&xc) && struct_key(x.node(xc)) == y_key);

        match existing {
            Some(x_child) => {
                matched.push(x_child);
                if let Some(d) = x.node_mut(x_child).dyn_data_mut() {
                    let y_metrics = y.node(y_child).dyn_data().map(|d| d.metrics.clone()).unwrap_or_default();
                    d.metrics.extend(y_metrics);
                }
                merge(x, x_child, y, y_child, x_num_metrics, y_num_metrics);
            }
            None => {
                let cloned = clone_subtree(x, y, y_child, x_num_metrics);
                x.append_child(x_id, cloned);
            }
        }
    }

    // Every x child that y had no counterpart for keeps its old column
    // count unless padded here; without this, later access by metric
    // index would silently read the wrong column for these subtrees.
    for x_child in x.children_of(x_id).to_vec() {
        if !matched.contains(&x_child) {
            pad_existing_subtree(x, x_child, y_num_metrics);
        }
    }
}

/// Top-level entry point: merges `y` into `x`, including padding every
/// surviving `x` node that wasn't matched with a `y` node (so every
/// dynamic node's metric vector ends up exactly `x_num_metrics +
/// y_num_metrics` long).
pub fn merge_trees(x: &mut Cct, y: &Cct, x_num_metrics: usize, y_num_metrics: usize) {
    let (Some(x_root), Some(y_root)) = (x.root(), y.root()) else {
        return;
    };
    merge(x, x_root, y, y_root, x_num_metrics, y_num_metrics);
}
