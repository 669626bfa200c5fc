//! Caller-facing API: the crypto session store, its records and its config.

pub mod config;
pub mod store;
pub mod types;
