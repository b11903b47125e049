//! NoETL Worker Pool
//!
//! Leases jobs from the control plane's queue, dispatches them through the
//! tool registry, and reports outcomes back over HTTP.
//!
//! This crate provides:
//! - A control plane HTTP client for the queue/event/context-render APIs
//! - A task executor dispatching leased jobs through `noetl-tools`
//! - An optional NATS JetStream wake-up hint to cut polling latency
//! - The worker loop tying lease, per-job heartbeat, and reporting together

pub mod client;
pub mod config;
pub mod events;
pub mod executor;
pub mod nats;
pub mod worker;

pub use config::WorkerConfig;
pub use worker::Worker;
