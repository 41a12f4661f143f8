//! SmartSnack pipeline library.
//!
//! Perception fusion, mood smoothing, per-category cooldown gating and a
//! local-first dual-write store, wired together by a single coordinator.
//! Everything that touches devices or the network sits behind the port
//! traits in [`app::ports`], so the domain modules are exercised by the
//! integration tests without hardware.

#![deny(unused_must_use)]

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

pub mod adapters;
pub mod app;
pub mod assembler;
pub mod config;
pub mod cooldown;
pub mod diagnostics;
pub mod error;
pub mod perception;
pub mod scheduler;
pub mod storage;
