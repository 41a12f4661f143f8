//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises a specific subsystem
//! against mock adapters.  All tests run on the host with no board,
//! camera or network required.

mod dual_write_tests;
mod mock_hw;
mod pipeline_tests;
mod replay_tests;
