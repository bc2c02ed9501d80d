#![warn(missing_docs)]
//! In-memory collaborators for exercising host and client sessions in tests.

mod gate;
mod world;

pub use gate::{FixedTicket, StaticGate};
pub use world::{flat_world, MemoryWorld};
