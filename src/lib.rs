//! # Backfill Orchestrator Library
//!
//! Per-merchant historical backfill orchestration: tenant configuration, the
//! durable job ledger, execution backends, the worker entry point and the
//! operator HTTP API.

pub mod auth;
pub mod backend;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod naming;
pub mod orchestrator;
pub mod pipeline;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub mod worker;
pub use migration;
