//! Core types and traits for the AgentMesh substrate.
//!
//! This crate defines the shared data model used by the message bus, tracer,
//! memory system and self-improvement loop. It contains no business logic.

pub mod agent;
pub mod config;
pub mod error;
pub mod improvement;
pub mod memory;
pub mod message;
pub mod trace;
