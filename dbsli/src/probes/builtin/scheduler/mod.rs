pub mod offcpu;

pub use offcpu::OffCpuProbe;
