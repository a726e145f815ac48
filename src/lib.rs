//! # fetchq
//!
//! Postgres-backed claim queue for two-stage acquisition pipelines
//! (download, then upload).
//!
//! Provides atomic skip-locked batch claims, lease expiry and reclamation,
//! a retrying worker loop, and fire-and-forget operational notifications.

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod notify;
pub mod queue;
pub mod reconciler;
pub mod telemetry;
pub mod worker;
