//! Connection-scoped aggregation pipelines over ingested rows
//!
//! Pipelines arrive as JSON (`[{"$match": ...}, {"$group": ...}]`), are parsed
//! into a closed set of typed [`Stage`]s and run in-process over documents
//! loaded from a [`DocumentSource`]. Only the connection ids named by the
//! pipeline's leading `$match` (and by scoped `$lookup` sub-pipelines) are
//! ever loaded.

pub mod engine;
pub mod expr;
pub mod filter;
pub mod stage;
pub mod validator;
pub mod value;

pub use engine::{execute, execute_within, DocumentSource};
pub use stage::{Pipeline, Stage};
pub use validator::{PipelineValidator, ValidationError};

/// Collection name user pipelines may `$lookup` into
pub const RAW_DATA_COLLECTION: &str = "sheet_raw_data";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Unknown pipeline stage '{0}'")]
    UnknownStage(String),
    #[error("Invalid {stage} stage: {reason}")]
    InvalidStage { stage: String, reason: String },
    #[error("Unsupported operator '{0}'")]
    UnsupportedOperator(String),
    #[error("Expression error: {0}")]
    Expression(String),
    #[error("Pipeline is not scoped to a connection: {0}")]
    Unscoped(String),
    #[error("Document source error: {0}")]
    Source(String),
}

impl PipelineError {
    pub(crate) fn invalid(stage: &str, reason: impl Into<String>) -> Self {
        PipelineError::InvalidStage {
            stage: stage.to_string(),
            reason: reason.into(),
        }
    }
}
