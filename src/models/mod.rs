//! Data models

mod vm;

pub use vm::*;
