//! soulact: act on a running browser tab over CDP and report what happened
//!
//! Exposes the CLI modules for integration testing.

pub mod cli;
