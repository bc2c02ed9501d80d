#![warn(missing_docs)]
//! Authoritative host side of a voxlink multiplayer session.

mod config;
mod host;

pub use config::HostConfig;
pub use host::{HostQueues, HostSession, JoinRequest, RosterEvent};
