//! # hookq
//!
//! Leased work queue and dispatch loop for outbound webhooks.
//!
//! Work items sit in a [`WorkItemStore`](store::WorkItemStore) until a
//! [`DispatchLoop`](engine::DispatchLoop) leases them, hands them to a
//! [`Sender`](sender::Sender), and settles the outcome: acknowledge on
//! success, release with backoff on transient failure, dead-letter on
//! permanent failure or exhausted attempts.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod query;
pub mod sender;
pub mod store;
pub mod telemetry;
