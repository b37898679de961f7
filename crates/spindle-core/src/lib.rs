//! Spindle Core — the flow execution engine for multi-agent workflows.
//!
//! A flow is a DAG whose nodes are remote HTTP agents and control-flow
//! operators (decision, loop, fork, join). The engine validates flow
//! definitions, schedules nodes as their dependencies complete, invokes
//! agents through an instrumented HTTP proxy, threads outputs between
//! nodes, and persists a durable execution trace.
//!
//! This crate is transport-agnostic: it exposes the [`engine::Engine`]
//! handle an HTTP (or any other) adapter drives. It has no HTTP-server
//! dependency by default.
//!
//! # Feature Flags
//!
//! - `axum` — Enables `IntoResponse` on [`error::EngineError`] for use in
//!   axum handlers.

pub mod catalog;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod expr;
pub mod models;
pub mod orchestrator;
pub mod proxy;
pub mod registry;
pub mod store;

// Convenience re-exports
pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle, SubmitOptions};
pub use error::EngineError;
