//! Steward - marketplace subscription lifecycle management.
//!
//! This crate drives a multi-step resource-provisioning workflow for
//! marketplace subscriptions, resolves interdependent deployment
//! parameters, allocates non-overlapping network ranges from finite
//! pools, and reconciles metered usage against a billing API with
//! idempotency guarantees.
//!
//! # Architecture
//!
//! The core is four components wired to their collaborators through
//! hexagonal ports:
//!
//! - [`cidr`] - pure IPv4 CIDR arithmetic backing address-pool allocation
//! - [`expr`] - a typed expression AST for deployment parameters, with
//!   dependency-ordered evaluation and cycle detection
//! - [`provision`] - the provisioning state machine: one side-effecting
//!   step per poll cycle, an explicit transition table, and a persisted
//!   compare-and-swap guarding webhook-driven operations
//! - [`metering`] - the per-meter hourly catch-up loop submitting usage
//!   idempotently and never advancing a watermark past an unresolved
//!   failure
//!
//! # Modules
//!
//! - [`config`] - configuration loading from TOML files
//! - [`domain`] - subscriptions, offers, meters, usage bookkeeping
//! - [`error`] - error types for the crate
//! - [`port`] - trait seams to persistence and the provisioning,
//!   fulfillment, telemetry and billing collaborators
//! - [`adapter`] - in-memory and REST implementations of the ports
//! - [`app`] - scheduler wiring for the binary
//!
//! Inbound surfaces (the marketplace webhook endpoint, any admin API) are
//! the embedding application's concern; it calls the orchestrator's
//! operation entry points directly.
//!
//! # Example
//!
//! ```no_run
//! use steward::app::App;
//! use steward::config::Config;
//!
//! # async fn run() -> steward::error::Result<()> {
//! let config = Config::load("config.toml")?;
//! App::run(config).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod app;
pub mod cidr;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod expr;
pub mod metering;
pub mod port;
pub mod provision;
