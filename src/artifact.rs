use std::fs;
use std::path::Path;

use anyhow::Context;
use log::info;
use serde::de::DeserializeOwned;

use crate::error::PredictError;
use crate::features::Scaler;
use crate::forest::RandomForest;
use crate::train::{ModelMetrics, TrainedArtifact};

pub const MODEL_FILE: &str = "mortality_model.json";
pub const SCALER_FILE: &str = "scaler.json";
pub const FEATURES_FILE: &str = "feature_columns.json";
pub const METRICS_FILE: &str = "model_metrics.json";

/// Persist the four artifact blobs. The serving path refuses to start
/// without all four.
pub fn save(dir: &Path, artifact: &TrainedArtifact) -> anyhow::Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create models dir {}", dir.display()))?;

    let write = |name: &str, json: String| -> anyhow::Result<()> {
        let path = dir.join(name);
        fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))
    };

    write(MODEL_FILE, serde_json::to_string(&artifact.forest)?)?;
    write(SCALER_FILE, serde_json::to_string(&artifact.scaler)?)?;
    write(
        FEATURES_FILE,
        serde_json::to_string_pretty(&artifact.feature_columns)?,
    )?;
    write(
        METRICS_FILE,
        serde_json::to_string_pretty(&artifact.metrics)?,
    )?;

    info!("model artifact saved to {}", dir.display());
    Ok(())
}

/// Load the four blobs, failing on any missing or unparseable file and on
/// any disagreement between the persisted feature schema and the fitted
/// model.
pub fn load(dir: &Path) -> Result<TrainedArtifact, PredictError> {
    let forest: RandomForest = read(dir, MODEL_FILE)?;
    let scaler: Scaler = read(dir, SCALER_FILE)?;
    let feature_columns: Vec<String> = read(dir, FEATURES_FILE)?;
    let metrics: ModelMetrics = read(dir, METRICS_FILE)?;

    if feature_columns.len() != forest.n_features {
        return Err(PredictError::SchemaMismatch {
            expected: forest.n_features,
            actual: feature_columns.len(),
        });
    }
    if scaler.mean.len() != forest.n_features {
        return Err(PredictError::SchemaMismatch {
            expected: forest.n_features,
            actual: scaler.mean.len(),
        });
    }

    info!(
        "model artifact loaded from {} ({} features)",
        dir.display(),
        feature_columns.len()
    );
    Ok(TrainedArtifact {
        forest,
        scaler,
        feature_columns,
        metrics,
    })
}

fn read<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<T, PredictError> {
    let path = dir.join(name);
    if !path.exists() {
        return Err(PredictError::ArtifactMissing(path));
    }
    let contents = fs::read_to_string(&path).map_err(|e| PredictError::ArtifactInvalid {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&contents).map_err(|e| PredictError::ArtifactInvalid {
        path,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::tests::{fast_config, synthetic_corpus};
    use crate::train::train;

    #[test]
    fn round_trip_reproduces_identical_predictions() {
        let artifact = train(&synthetic_corpus(), fast_config()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &artifact).unwrap();
        let reloaded = load(dir.path()).unwrap();

        let snapshot = crate::features::Snapshot {
            confirmed: Some(4000.0),
            deaths: Some(300.0),
            recovered: Some(1200.0),
            ..Default::default()
        };
        let vector = snapshot.feature_vector().unwrap();
        let before = artifact
            .forest
            .predict_proba(&artifact.scaler.transform(&vector).unwrap())
            .unwrap();
        let after = reloaded
            .forest
            .predict_proba(&reloaded.scaler.transform(&vector).unwrap())
            .unwrap();
        assert_eq!(before, after);
        assert_eq!(artifact.feature_columns, reloaded.feature_columns);
    }

    #[test]
    fn missing_blob_fails_loudly_by_name() {
        let artifact = train(&synthetic_corpus(), fast_config()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &artifact).unwrap();
        std::fs::remove_file(dir.path().join(SCALER_FILE)).unwrap();

        let err = load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("scaler.json"), "{err}");
    }
}
