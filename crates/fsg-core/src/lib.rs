//! Core domain + application logic for the file share gateway.
//!
//! Framework-agnostic: Telegram lives behind ports (traits) implemented in the
//! adapter crate. The three engines are the token ledger (`tokens`), the
//! reference resolver (`resolver`) and the deletion scheduler (`deletion`);
//! `gateway` wires them into the request flow.

pub mod clock;
pub mod config;
pub mod deletion;
pub mod delivery;
pub mod domain;
pub mod errors;
pub mod gateway;
pub mod index;
pub mod ingest;
pub mod links;
pub mod logging;
pub mod maintenance;
pub mod moderation;
pub mod notify;
pub mod records;
pub mod resolver;
pub mod retention;
pub mod search;
pub mod store;
pub mod tokens;
pub mod utils;

#[cfg(test)]
pub(crate) mod testkit;

pub use errors::{Error, Result};
