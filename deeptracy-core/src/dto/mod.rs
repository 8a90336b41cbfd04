//! Data Transfer Objects
//!
//! Lightweight payloads exchanged with the analysis backend and with the
//! task containers spawned by analyze builds.

pub mod analysis;
