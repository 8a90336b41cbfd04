//! Deeptracy Core
//!
//! Core types and abstractions for the Deeptracy build orchestrator.
//!
//! This crate contains:
//! - Domain types: Builds, property sets, task specs, workers and signals
//! - DTOs: Payloads exchanged with the analysis backend and task containers

pub mod domain;
pub mod dto;
