// "rite kernel": cooperative script sandboxes for single-core embedded hosts

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod drivers;
pub mod irq;
pub mod kernel;
pub mod loader;
pub mod sandbox;
pub mod shell;
pub mod vm;

#[cfg(test)]
pub(crate) mod testing;
