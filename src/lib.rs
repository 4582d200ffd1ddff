//! # tasq-rs
//!
//! Request/response task dispatch over a shared list + pub/sub store.
//!
//! A [`Caller`] pushes a request onto a topic queue and waits for the
//! answer on its private channel; a [`Worker`] drains the queue under a
//! concurrency cap and publishes results back. The store is pluggable
//! ([`store::Store`]): in-memory for tests and single-process use, Postgres
//! ([`db::Db`]) for everything else.

pub mod caller;
pub mod config;
pub mod correlation;
pub mod db;
pub mod envelope;
pub mod error;
pub mod id;
pub mod model;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use caller::{Caller, CallerOptions, RequestOptions};
pub use error::{Error, Result};
pub use worker::{Handlers, ServeOptions, Worker};
