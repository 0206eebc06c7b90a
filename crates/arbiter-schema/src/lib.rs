//! # arbiter-schema
//!
//! JSON Schema registry for ARBITER. Resource policies may declare schemas
//! for principal and resource attributes; the engine validates the request
//! against them and the configured enforcement mode decides whether
//! violations deny, warn, or are skipped.

pub mod registry;

pub use registry::SchemaRegistry;
