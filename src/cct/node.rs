//! The calling-context tree itself: an arena of tagged-union nodes.
//!
//! Every scope kind (program, group, call site, loop, ...) is one variant
//! of a single `CctNode` enum rather than a class in an inheritance
//! hierarchy, and the tree is a flat arena of slots linked by index
//! rather than raw pointers.

use std::path::PathBuf;

use crate::core::vma::Vma;

pub type NodeId = usize;

/// The association-class / logical-unwind-structure-hierarchy tag carried
/// by dynamic nodes, used (together with the unrelocated ip and the
/// logical ip) as part of the merge identity key. `Direct` covers the
/// overwhelming majority of samples (ordinary native call frames).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssocClass {
    Direct,
    InterfaceOnly,
    LogicalOnly,
    Both,
}

/// Fields shared by every "dynamic" node (one produced directly by a
/// sample): a call-site (`CallSite`) before correlation, or a statement
/// (`Statement`) after it's been matched against static structure.
#[derive(Debug, Clone)]
pub struct DynNodeData {
    /// Unrelocated instruction pointer (static/link-time address).
    pub ip: Vma,
    pub op_index: u16,
    pub lm_id: Option<u32>,
    pub assoc: AssocClass,
    /// Logical instruction pointer, present only for LUSH-style logical
    /// unwinds; 0 for ordinary native frames.
    pub lush_lip: u64,
    /// Filled in by the correlator once the node has been matched to
    /// static structure; `None` beforehand.
    pub file: Option<PathBuf>,
    pub proc: Option<String>,
    pub line: u32,
    /// `true` when `file` is a resolved source file (correlation found an
    /// enclosing static scope); `false` when it's merely the load-module
    /// name, i.e. a soft correlation miss.
    pub file_is_text: bool,
    /// Static structure id of the scope this node was correlated against.
    pub structure_id: Option<u32>,
    /// Set when the unwind that produced this node's subtree was cut short
    /// before reaching the true program root (stack-walk failure, unwind
    /// depth limit, or a signal frame the unwinder couldn't cross).
    pub incomplete: bool,
    pub metrics: Vec<f64>,
}

impl DynNodeData {
    pub fn new(ip: Vma, op_index: u16, assoc: AssocClass, lush_lip: u64, metrics: Vec<f64>) -> Self {
        DynNodeData {
            ip,
            op_index,
            lm_id: None,
            assoc,
            lush_lip,
            file: None,
            proc: None,
            line: 0,
            file_is_text: false,
            structure_id: None,
            incomplete: false,
            metrics,
        }
    }

    /// The merge identity key for this node: nodes from two trees with
    /// equal keys (and the same parent) are the same calling context and
    /// must be merged rather than duplicated.
    pub fn merge_key(&self) -> (AssocClass, Vma, u64) {
        (self.assoc, self.ip, self.lush_lip)
    }
}

/// A node of the calling-context tree.
#[derive(Debug, Clone)]
pub enum CctNode {
    /// Tree root: the program as a whole. At most one per tree.
    Pgm { name: String, frozen: bool },
    /// A synthetic grouping node with no code address of its own (used to
    /// fan out into per-thread or per-process subtrees).
    Group { name: String },
    /// A procedure activation record introduced by loop-nest/inlining
    /// placement; `is_alien` marks a frame whose source attribution came
    /// from an inlined callee rather than the enclosing procedure's own
    /// file.
    ProcedureFrame {
        file: Option<PathBuf>,
        proc: Option<String>,
        is_alien: bool,
        /// First line of this scope (the enclosing procedure's own
        /// `beg_line`, or the inlined callee's for an alien frame).
        line: u32,
        /// Mirrors `DynNodeData::file_is_text`: false when `file` is a
        /// fallback load-module name rather than a resolved source file.
        file_is_text: bool,
    },
    /// An as-sampled call site, prior to correlation with static
    /// structure. The correlator replaces every leaf `CallSite` with a
    /// `Statement`.
    CallSite(DynNodeData),
    /// A correlated leaf: a call site that has been matched to a specific
    /// source line.
    Statement(DynNodeData),
    /// A recovered loop scope introduced by loop-nest placement.
    Loop {
        file: Option<PathBuf>,
        beg_line: u32,
        end_line: u32,
    },
    /// A range of statements sharing a single structure-tree scope, used
    /// when finer-grained statement boundaries aren't available.
    StmtRange {
        file: Option<PathBuf>,
        beg_line: u32,
        end_line: u32,
    },
}

impl CctNode {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, CctNode::CallSite(_) | CctNode::Statement(_))
    }

    pub fn dyn_data(&self) -> Option<&DynNodeData> {
        match self {
            CctNode::CallSite(d) | CctNode::Statement(d) => Some(d),
            _ => None,
        }
    }

    pub fn dyn_data_mut(&mut self) -> Option<&mut DynNodeData> {
        match self {
            CctNode::CallSite(d) | CctNode::Statement(d) => Some(d),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            CctNode::Pgm { .. } => "PGM",
            CctNode::Group { .. } => "G",
            CctNode::ProcedureFrame { .. } => "PF",
            CctNode::CallSite(_) => "C",
            CctNode::Statement(_) => "S",
            CctNode::Loop { .. } => "L",
            CctNode::StmtRange { .. } => "SR",
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    node: Option<CctNode>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// An arena-backed calling-context tree. Nodes are identified by stable
/// indices (`NodeId`) rather than pointers; `unlink`ed nodes remain in the
/// arena as tombstones so outstanding `NodeId`s never dangle.
#[derive(Debug, Default)]
pub struct Cct {
    slots: Vec<Slot>,
    root: Option<NodeId>,
}

impl Cct {
    pub fn new() -> Self {
        Cct::default()
    }

    pub fn alloc(&mut self, node: CctNode) -> NodeId {
        let id = self.slots.len();
        self.slots.push(Slot {
            node: Some(node),
            parent: None,
            children: Vec::new(),
        });
        id
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn set_root(&mut self, id: NodeId) {
        self.root = Some(id);
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn node(&self, id: NodeId) -> &CctNode {
        self.slots[id].node.as_ref().expect("use of unlinked node")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut CctNode {
        self.slots[id].node.as_mut().expect("use of unlinked node")
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.slots[id].parent
    }

    pub fn children_of(&self, id: NodeId) -> &[NodeId] {
        &self.slots[id].children
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.slots[id].children.is_empty()
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.slots[child].parent = Some(parent);
        self.slots[parent].children.push(child);
    }

    /// Inserts `child` as a new child of `parent` at the position
    /// previously occupied by `old`, without disturbing `old` itself —
    /// used when a node needs a new child spliced in front of its
    /// siblings.
    pub fn insert_before(&mut self, parent: NodeId, new_child: NodeId, old: NodeId) {
        self.slots[new_child].parent = Some(parent);
        let children = &mut self.slots[parent].children;
        let pos = children.iter().position(|&c| c == old).unwrap_or(children.len());
        children.insert(pos, new_child);
    }

    /// Removes `id` from its parent's child list. `id`'s own children are
    /// untouched; the caller is expected to either re-attach or discard
    /// them.
    pub fn unlink(&mut self, id: NodeId) {
        if let Some(parent) = self.slots[id].parent.take() {
            self.slots[parent].children.retain(|&c| c != id);
        }
    }

    /// Replaces `old` with `new` in `old`'s parent's child list, and moves
    /// `old`'s children to become `new`'s children. Used by leaf
    /// normalization (`CallSite` -> `Statement`) and by the correlator
    /// when nesting a flat call-site chain under recovered structure.
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) {
        let parent = self.slots[old].parent;
        let children = std::mem::take(&mut self.slots[old].children);
        for &c in &children {
            self.slots[c].parent = Some(new);
        }
        self.slots[new].children = children;
        self.slots[new].parent = parent;
        if let Some(parent) = parent {
            if let Some(slot) = self.slots[parent].children.iter_mut().find(|c| **c == old) {
                *slot = new;
            }
        } else if self.root == Some(old) {
            self.root = Some(new);
        }
        self.slots[old].parent = None;
        self.slots[old].children.clear();
    }

    /// Preorder traversal starting at `start` (root-to-leaves, visiting a
    /// node before its children).
    pub fn preorder(&self, start: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.slots[id].children.iter().rev().copied());
        }
        out
    }
}
