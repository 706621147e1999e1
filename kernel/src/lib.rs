#![cfg_attr(target_os = "none", no_std)]

pub mod block;
pub mod drivers;
pub mod fs;
pub mod logging;
pub mod sync;
pub mod system;
pub mod vm;

extern crate alloc;
