pub mod loop_recovery;
pub mod tree;
pub mod vma_interval;

pub use tree::{ScopeKind, StructureNode, StructureTree};
pub use vma_interval::{VmaInterval, VmaIntervalSet};
