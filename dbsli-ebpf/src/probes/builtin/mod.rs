pub mod offcpu;
pub mod sli;
mod syscall_types;
