use std::path::PathBuf;

use thiserror::Error;

/// Failures on the prediction path. The distinction between categories is
/// part of the contract: validation errors name the offending fields, shape
/// mismatches are always surfaced (a silent misprediction is the worst
/// failure mode a decision-support tool has), and a missing artifact is a
/// service-level failure rather than a request-level one.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("missing required fields: {0}")]
    MissingFields(String),

    #[error("feature schema mismatch: expected {expected} features, got {actual}")]
    SchemaMismatch { expected: usize, actual: usize },

    #[error("model artifact missing: {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("failed to load model artifact {}: {reason}", .path.display())]
    ArtifactInvalid { path: PathBuf, reason: String },
}
