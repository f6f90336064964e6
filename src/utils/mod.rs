//! Small shared utilities

pub mod cpu;

pub use cpu::pin_to_cpu;
