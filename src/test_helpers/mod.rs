//! Shared builders and fakes for unit tests.

pub mod fixtures;
pub mod temp;
