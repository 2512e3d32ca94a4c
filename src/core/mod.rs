pub mod loadmodule;
pub mod metric;
pub mod vma;

pub use loadmodule::{Epoch, LoadModule};
pub use metric::MetricDescriptor;
pub use vma::{OpIp, Vma};
