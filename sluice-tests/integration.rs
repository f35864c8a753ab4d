//! Integration tests for Sluice
//!
//! These tests drive the resolver, registry, supervisor and reaper together
//! against a mock origin and the simulated transcoder.

#[path = "common/mod.rs"]
mod common;

#[path = "integration/redirects.rs"]
mod redirects;
#[path = "integration/registry_lifecycle.rs"]
mod registry_lifecycle;
#[path = "integration/refcount_properties.rs"]
mod refcount_properties;
