//! Application core: pure domain logic, zero I/O.
//!
//! This module contains the business rules for the SmartSnack pipeline:
//! detection fusion, mood smoothing, cooldown gating, event assembly and
//! the deferred emotion backfill.  All interaction with cameras, models,
//! the feedback board and storage happens through **port traits**
//! defined in [`ports`], keeping this layer testable without devices.

pub mod commands;
pub mod events;
pub mod ports;
pub mod service;
