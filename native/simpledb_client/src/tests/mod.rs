//! Unit and integration tests for simpledb_client
//!
//! This module organizes all tests into logical submodules that correspond to
//! the main library modules. Integration tests run against the loopback
//! server; failure paths run against a scripted transport.

mod integration_tests;
pub(crate) mod test_utils;
mod utils_tests;
