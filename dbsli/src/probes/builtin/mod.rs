pub mod scheduler;
pub mod sli;

pub use scheduler::OffCpuProbe;
pub use sli::SliConnTracker;
