use std::path::Path;

use crate::artifact;
use crate::error::PredictError;
use crate::features::Snapshot;
use crate::models::{RiskAssessment, RiskLevel};
use crate::train::{ModelMetrics, TrainedArtifact};

/// Read-only inference wrapper around a loaded artifact. Constructed once at
/// process start and handed to whatever drives it; it holds no mutable state,
/// so concurrent readers are safe by construction.
pub struct MortalityPredictor {
    artifact: TrainedArtifact,
}

impl MortalityPredictor {
    pub fn load(models_dir: &Path) -> Result<Self, PredictError> {
        Ok(MortalityPredictor {
            artifact: artifact::load(models_dir)?,
        })
    }

    pub fn from_artifact(artifact: TrainedArtifact) -> Self {
        MortalityPredictor { artifact }
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.artifact.feature_columns
    }

    pub fn metrics(&self) -> &ModelMetrics {
        &self.artifact.metrics
    }

    /// Score one snapshot. Pure function of (artifact, snapshot): the vector
    /// is built in the persisted feature order, scaled with the persisted
    /// transform, scored, and banded. The mortality rate in the result is
    /// recomputed from the raw input, not from the model.
    pub fn predict(&self, snapshot: &Snapshot) -> Result<RiskAssessment, PredictError> {
        let vector = snapshot.feature_vector()?;
        if vector.len() != self.artifact.feature_columns.len() {
            return Err(PredictError::SchemaMismatch {
                expected: self.artifact.feature_columns.len(),
                actual: vector.len(),
            });
        }

        let scaled = self.artifact.scaler.transform(&vector)?;
        let risk_score = self.artifact.forest.predict_proba(&scaled)?;
        let risk_level = RiskLevel::from_score(risk_score);

        Ok(RiskAssessment {
            prediction: (risk_score > 0.5) as i32,
            risk_score,
            risk_level,
            risk_color: risk_level.color(),
            confidence: risk_score.max(1.0 - risk_score),
            recommendation: risk_level.advisory(),
            mortality_rate: snapshot.mortality_rate(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::tests::{fast_config, synthetic_corpus};
    use crate::train::train;

    fn predictor() -> MortalityPredictor {
        MortalityPredictor::from_artifact(train(&synthetic_corpus(), fast_config()).unwrap())
    }

    #[test]
    fn missing_required_fields_never_reach_the_model() {
        let p = predictor();
        let err = p.predict(&Snapshot::default()).unwrap_err();
        assert!(matches!(err, PredictError::MissingFields(_)));
    }

    #[test]
    fn assessment_is_internally_consistent() {
        let p = predictor();
        let snapshot = Snapshot {
            confirmed: Some(1000.0),
            deaths: Some(50.0),
            ..Default::default()
        };
        let out = p.predict(&snapshot).unwrap();
        assert!((0.0..=1.0).contains(&out.risk_score));
        assert_eq!(out.risk_level, RiskLevel::from_score(out.risk_score));
        assert_eq!(out.recommendation, out.risk_level.advisory());
        assert!((out.mortality_rate - 5.0).abs() < 1e-12);
        assert!(out.confidence >= 0.5);
        assert_eq!(out.prediction, (out.risk_score > 0.5) as i32);
    }

    #[test]
    fn identical_inputs_yield_identical_predictions() {
        let p = predictor();
        let snapshot = Snapshot {
            confirmed: Some(8000.0),
            deaths: Some(720.0),
            recovered: Some(2000.0),
            ..Default::default()
        };
        let a = p.predict(&snapshot).unwrap();
        let b = p.predict(&snapshot).unwrap();
        assert_eq!(a.risk_score, b.risk_score);
        assert_eq!(a.risk_level, b.risk_level);
    }

    #[test]
    fn zero_confirmed_reports_zero_mortality() {
        let p = predictor();
        let snapshot = Snapshot {
            confirmed: Some(0.0),
            deaths: Some(10.0),
            ..Default::default()
        };
        let out = p.predict(&snapshot).unwrap();
        assert_eq!(out.mortality_rate, 0.0);
    }

    #[test]
    fn truncated_schema_is_a_mismatch_not_a_silent_pad() {
        let mut artifact = train(&synthetic_corpus(), fast_config()).unwrap();
        artifact.feature_columns.truncate(10);
        let p = MortalityPredictor::from_artifact(artifact);
        let snapshot = Snapshot {
            confirmed: Some(100.0),
            deaths: Some(5.0),
            ..Default::default()
        };
        let err = p.predict(&snapshot).unwrap_err();
        assert!(matches!(err, PredictError::SchemaMismatch { .. }));
    }
}
