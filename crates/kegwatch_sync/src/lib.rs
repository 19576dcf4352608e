//! Cloud delivery.
//!
//! The flush worker runs as its own task, fully decoupled from capture
//! timing: it drains due tasks from the durable queue, POSTs them, and
//! retries on a configured backoff schedule. A task leaves the queue only
//! on a cloud ack (at-least-once); an exhausted budget parks it FAILED
//! for manual resync, never drops it.

mod client;
mod worker;

pub use client::{CloudApi, HttpCloudApi, SyncError};
pub use worker::{SyncConfig, SyncNotice, SyncWorker};
