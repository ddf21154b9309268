//! Core types shared by the nodelink communication crates.
//!
//! This crate defines node identities, the request/response envelopes that
//! travel between nodes, the shared error type and the configuration model.
//! It contains no networking logic.

pub mod config;
pub mod error;
pub mod identity;
pub mod message;
pub mod serde_compat;
pub mod timing;

pub use error::{NodeLinkError, NodeLinkResult};
pub use identity::{InitialNodeInformation, InstanceNodeSessionId};
pub use message::{NetworkRequest, NetworkResponse, ResultCode};
