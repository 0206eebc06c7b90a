//! # arbiter-engine
//!
//! The decision core of ARBITER: compiles loaded policies into
//! lookup-optimized units, holds them in a hot-swappable snapshot index,
//! and evaluates check requests and plan queries against them.
//!
//! ```rust,ignore
//! let store = Arc::new(Store::new());
//! store.publish(compile(&policies)?);
//! let engine = Engine::new(store, Arc::new(SchemaRegistry::new()), EngineConfig::default());
//! let decision = engine.check(&input)?;
//! ```

pub mod compile;
pub mod engine;
pub mod index;
pub mod planner;

#[cfg(test)]
mod fixtures;

pub use compile::{compile, CompiledPolicy};
pub use engine::Engine;
pub use index::{Snapshot, Store};
pub use planner::{PlanFilter, PlanInput, PlanOutput, PlanResource};
