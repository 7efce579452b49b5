//! Step definition modules for Cucumber feature tests.

pub mod connection;
pub mod harness;
pub mod mutations;
pub mod projection;
