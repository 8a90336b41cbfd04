//! Core domain types
//!
//! This module contains the core domain structures used across Deeptracy crates.
//! They carry no I/O: the runner executes builds over them and the client
//! renders signals from them.

pub mod build;
pub mod property;
pub mod signal;
pub mod task;
pub mod worker;
