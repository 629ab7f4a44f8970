//! Backend implementations shipped with the pool.

mod cpu;
pub use cpu::*;
