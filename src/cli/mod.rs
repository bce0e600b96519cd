//! CLI command implementations
//!
//! This module contains the implementation of all CLI commands.

pub mod tunnel;
