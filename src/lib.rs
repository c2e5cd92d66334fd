#![warn(clippy::all)]

pub mod error;
pub mod raft;

pub use raft::Server;
