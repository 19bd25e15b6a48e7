//! Dispatcher and worker server components.
//!
//! ## Structure
//!
//! - [`config`] - CLI/environment parsing and validated configs.
//! - [`service`] - the `TextDispatcher` and `TextWorker` implementations.
//! - [`pool`] - worker proxies and selection strategies.
//! - [`jobs`] - asynchronous job table and its reaper.
//! - [`staging`] - staging directory layout and cleanup helpers.
//! - [`listener`] - tonic server bootstrap with health and reflection.
//! - [`telemetry`] - logging and optional OpenTelemetry export.

pub mod config;
pub mod jobs;
pub mod listener;
pub mod pool;
pub mod service;
pub mod staging;
pub mod telemetry;
