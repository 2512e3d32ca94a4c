pub mod dump;
pub mod insert;
pub mod iter;
pub mod merge;
pub mod node;

pub use insert::{BacktraceInserter, SampledFrame};
pub use node::{AssocClass, Cct, CctNode, DynNodeData, NodeId};
