//! jim: fuzzy SSH connection launcher
//!
//! A long-lived local daemon holds an encrypted server inventory in memory,
//! indexes it with a full-text search engine, and answers fuzzy-match queries
//! from short-lived CLI invocations over a Unix domain socket. The master
//! password is entered once per session; the idle-lock timer re-locks the
//! inventory after a period without queries.

pub mod client;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod inventory;
pub mod search;

pub use config::JimPaths;
pub use inventory::Inventory;
