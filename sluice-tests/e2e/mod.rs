//! End-to-end tests for Sluice
//!
//! These tests run the full HTTP surface on a real listener and play it the
//! way a browser player would.

#[path = "../common/mod.rs"]
mod common;

mod streaming_workflow;
