//! Common test utilities
#![allow(dead_code)]

pub mod fake_miniserver;
pub mod loxone_mock;
pub mod test_fixtures;
