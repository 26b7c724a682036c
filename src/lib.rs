//! Peer-to-peer video rooms coordinated through a shared document store.

pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod room;
pub mod session;
pub mod store;

pub use crate::error::{AppError, Result};
