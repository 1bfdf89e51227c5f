//! swconf core: the softwire control plane.
//!
//! A leader process owns one schema-validated configuration tree, serves
//! path queries and mutations over a Unix socket, and supervises one
//! data-plane worker per configured device/queue.

pub mod bindgen;
pub mod client;
pub mod daemon;
pub mod data;
pub mod dispatch;
pub mod error;
pub mod instance;
pub mod path;
pub mod projection;
pub mod protocol;
pub mod rundir;
pub mod schema;
pub mod service;
pub mod settings;
pub mod state;
pub mod store;

#[cfg(test)]
mod fixtures;

pub use error::{ConfigError, ErrorKind, Result};
