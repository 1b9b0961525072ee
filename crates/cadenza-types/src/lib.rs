//! Shared domain types for Cadenza.
//!
//! This crate contains the core domain types used across the Cadenza
//! orchestration platform: Workflow, WorkflowStep, Agent, ApprovalGate,
//! audit records, bus events, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod error;
pub mod event;
pub mod workflow;
