//! Traversal helpers beyond the plain preorder walk on [`Cct`].
//!
//! When writing output, a node's children are visited in source-line
//! order rather than arena/creation order, so the emitted XML reads
//! top-to-bottom the way the source file does.

use crate::cct::node::{Cct, CctNode, NodeId};

fn line_of(node: &CctNode) -> u32 {
    match node {
        CctNode::Loop { beg_line, .. } | CctNode::StmtRange { beg_line, .. } => *beg_line,
        CctNode::CallSite(d) | CctNode::Statement(d) => d.line,
        CctNode::ProcedureFrame { .. } | CctNode::Pgm { .. } | CctNode::Group { .. } => 0,
    }
}

/// Returns `parent`'s children ordered by source line (ties keep arena
/// order, which is itself sample/creation order — a stable sort).
pub fn line_sorted_children(cct: &Cct, parent: NodeId) -> Vec<NodeId> {
    let mut children: Vec<NodeId> = cct.children_of(parent).to_vec();
    children.sort_by_key(|&id| line_of(cct.node(id)));
    children
}

/// Preorder traversal that visits children in line-sorted order at every
/// level, used by the XML writer and the `--dump-cct` diagnostic.
pub fn line_sorted_preorder(cct: &Cct, start: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        out.push(id);
        let mut children = line_sorted_children(cct, id);
        children.reverse();
        stack.extend(children);
    }
    out
}
