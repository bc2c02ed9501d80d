#![warn(missing_docs)]
//! Client side of a voxlink multiplayer session.

mod config;
mod session;

pub use config::ClientConfig;
pub use session::{
    ClientQueues, ClientSession, ConnectError, JoinApproval, JoinedWorld, WorldSyncEvent,
};
