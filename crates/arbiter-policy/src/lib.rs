//! # arbiter-policy
//!
//! Policy loading for the ARBITER decision point: decoding (YAML/JSON),
//! structural validation, and content hashing. The output of this crate —
//! [`loader::Policy`] — is frozen; the compiler in `arbiter-engine` turns
//! sets of them into evaluable compilation units.

pub mod hash;
pub mod loader;
pub mod validate;

pub use hash::{content_hash, hash_hex};
pub use loader::{load_policy, load_policy_dir, load_policy_file, DirLoad, Policy, SourceFormat};
pub use validate::validate_document;
