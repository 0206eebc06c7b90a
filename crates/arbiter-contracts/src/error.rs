//! Error types for the ARBITER decision pipeline.
//!
//! All fallible operations return `ArbiterResult<T>`. Variants partition
//! into five classes matching the pipeline stages: load, validation,
//! compilation, evaluation, and cancellation. Load/validation/compilation
//! errors stop a policy from being published; evaluation errors raised while
//! testing a single rule are trapped by the engine and recorded in the
//! decision trace instead of failing the request.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single structural validation failure, addressed by field path.
///
/// `path` is a dotted/indexed locator into the source document, e.g.
/// `resourcePolicy.rules[2].actions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    /// Field path of the offending value within the policy document.
    pub path: String,
    /// What the validator expected and what it found.
    pub message: String,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// The unified error type for the ARBITER pipeline.
#[derive(Debug, Error)]
pub enum ArbiterError {
    // ── Load ────────────────────────────────────────────────────────────────

    /// The byte stream could not be decoded in the advertised format.
    #[error("malformed {format} source: {reason}")]
    MalformedSource { format: String, reason: String },

    /// A YAML stream contained more than one `---`-separated document.
    #[error("multiple policies in one file")]
    MultipleDocuments,

    /// A source file could not be read.
    #[error("failed to read '{path}': {reason}")]
    Io { path: String, reason: String },

    // ── Validation ──────────────────────────────────────────────────────────

    /// The decoded document violated one or more structural invariants.
    ///
    /// All failures for a document are collected before reporting so the
    /// author sees the full set in one pass.
    #[error("policy failed structural validation: {}", format_failures(failures))]
    Validation { failures: Vec<ValidationFailure> },

    // ── Compilation ─────────────────────────────────────────────────────────

    /// A policy referenced an import that is not present in the index.
    #[error("{kind} '{name}' imported by {importer} is not defined")]
    MissingImport {
        /// What was imported: `derived roles` or `export variables`.
        kind: String,
        name: String,
        /// Identifier of the importing policy.
        importer: String,
    },

    /// Two policies share the same `(kind, target, version, scope)` identity.
    #[error("duplicate policy identity: {id}")]
    DuplicatePolicy { id: String },

    /// Variable definitions form a cycle and cannot be ordered.
    #[error("cyclic variable definitions: {names}")]
    VariableCycle { names: String },

    /// A condition referenced `variables.<name>` with no matching definition.
    #[error("variable '{name}' referenced by {policy} is not defined")]
    UndefinedVariable { name: String, policy: String },

    /// An action or resource pattern failed to compile as a glob.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // ── Evaluation ──────────────────────────────────────────────────────────

    /// A condition or variable expression could not be parsed.
    #[error("expression parse error at offset {offset}: {message}")]
    ExprParse { message: String, offset: usize },

    /// An expression produced or combined values of the wrong type.
    #[error("expression type error: {message}")]
    ExprType { message: String },

    /// A name lookup failed during expression evaluation.
    #[error("unknown name '{name}'")]
    UnknownName { name: String },

    /// Integer division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Any other runtime expression failure (bad regex, index out of range).
    #[error("expression evaluation error: {message}")]
    ExprEval { message: String },

    /// A schema reference did not resolve against the registry.
    #[error("schema '{reference}' is not registered")]
    NoSuchSchema { reference: String },

    /// A registered schema document is itself not a valid JSON Schema.
    #[error("invalid schema document '{reference}': {reason}")]
    SchemaInvalid { reference: String, reason: String },

    // ── Cancellation ────────────────────────────────────────────────────────

    /// The caller's cancellation signal fired mid-evaluation.
    #[error("evaluation canceled")]
    Canceled,
}

/// Convenience alias used throughout the ARBITER crates.
pub type ArbiterResult<T> = Result<T, ArbiterError>;

fn format_failures(failures: &[ValidationFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
