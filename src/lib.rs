#![forbid(unsafe_code)]

//! Client for the ACT-R remote interface.
//!
//! The [`rpc`] module implements the bidirectional transport: correlated
//! calls to the peer, and peer calls into procedures registered locally.
//! The [`client`] module layers the command conveniences on top.

pub mod client;
pub mod config;
pub mod errors;
pub mod rpc;

pub use client::Client;
pub use config::ClientConfig;
pub use errors::{AppError, Result};
