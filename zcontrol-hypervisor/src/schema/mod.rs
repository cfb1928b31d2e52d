//! Structural parameter schemas.
//!
//! Every lifecycle action accepts a free-form `parameters` document. The
//! shape each action accepts is described by a JSON schema (draft 4 subset)
//! stored under `schemas/{family}/actions/{action}.json`. Shared definitions
//! live under `schemas/{family}/entities/` and `schemas/common/entities/`
//! and are pulled in with relative `$ref`s.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐   load    ┌────────────────────┐
//! │  schemas/**.json   │ ────────▶ │      Compiler      │
//! │ (dir or built-in)  │           │ $ref resolution,   │
//! └────────────────────┘           │ cycle detection    │
//!                                  └─────────┬──────────┘
//!                                            ▼
//!                                  ┌────────────────────┐
//!                                  │  SchemaRepository  │
//!                                  │ arena of nodes     │
//!                                  └─────────┬──────────┘
//!                                            ▼ validate(ctx, doc)
//!                                  ┌────────────────────┐
//!                                  │  ViolationReport   │
//!                                  └────────────────────┘
//! ```
//!
//! The repository is built once and never mutated afterwards; validation is
//! a pure function of the arena and the document.

mod compile;
mod format;
mod report;
mod repository;
mod validator;

pub use format::Format;
pub use report::{Alternative, ConstraintKind, Violation, ViolationReport};
pub use repository::{SchemaRepository, ValidationContext};

use thiserror::Error;

/// Errors raised while building the schema repository.
///
/// These are load-time failures. Validation failures of a parameters
/// document are reported through [`ViolationReport`] instead.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// A schema file or directory could not be read.
    #[error("Failed to read schema {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A schema file is not valid JSON.
    #[error("Failed to parse schema {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// A `$ref` points at a file or fragment that does not exist.
    #[error("Unresolved reference '{reference}' in {origin}: {target} does not exist")]
    MissingReference {
        origin: String,
        reference: String,
        target: String,
    },

    /// A chain of `$ref`s leads back to a schema that is still being built.
    #[error("Cyclic schema reference: {chain}")]
    CyclicReference { chain: String },

    /// A `$ref` fragment is not a JSON pointer.
    #[error("Invalid JSON pointer '{pointer}' in {origin}")]
    InvalidPointer { origin: String, pointer: String },

    /// A recognized keyword carries a value of the wrong shape.
    #[error("Invalid keyword '{keyword}' at {origin}: {reason}")]
    InvalidKeyword {
        origin: String,
        keyword: String,
        reason: String,
    },

    /// A `pattern` keyword does not compile as a regular expression.
    #[error("Invalid pattern '{pattern}' at {origin}: {reason}")]
    InvalidPattern {
        origin: String,
        pattern: String,
        reason: String,
    },
}
