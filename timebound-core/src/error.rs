//! Analysis Error Handling
//!
//! This module provides the error sum type of the analysis core using
//! `thiserror`. Every failure kind of the pipeline is a distinct variant;
//! analyses fail the whole workspace on the first error. Recoverable
//! conditions (unresolved branch target, unknown callee) are not errors:
//! they degrade precision through the `unknown` CFG sink instead.

use thiserror::Error;

/// Analysis error kinds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// Binary cannot be opened or decoded.
    #[error("load error: {0}")]
    Load(String),

    /// An instruction cannot be decoded at a required address.
    #[error("decoding error at 0x{0:08X}")]
    Decode(u32),

    /// An access or reference leaves the mapped address space.
    #[error("address 0x{0:08X} is outside every mapped segment")]
    OutOfSegment(u32),

    /// A required feature has no provider in the current workspace.
    #[error("no provider for required feature '{0}'")]
    UnsupportedFeature(&'static str),

    /// A traversal invariant (calls/returns balanced on any path) is violated.
    #[error("unstructured CFG in '{function}': {reason}")]
    UnstructuredCfg { function: String, reason: String },

    /// A loop has no bound and no back-edge constraint.
    #[error("loop headed at 0x{0:08X} has no flow-fact bound")]
    FlowFactMissing(u32),

    /// The external ILP solver refused or failed the model.
    #[error("ILP solver error: {0}")]
    Solver(String),

    /// An option value is malformed.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<std::io::Error> for AnalysisError {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        AnalysisError::Load(format!("IO error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
