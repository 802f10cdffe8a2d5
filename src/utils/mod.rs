//! Utility functions for the session pool

pub mod time;

pub use time::*;
