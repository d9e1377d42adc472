use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::features::{build_training_rows, percentile, Scaler, TrainingRow, FEATURE_COLUMNS};
use crate::forest::{ForestConfig, RandomForest};
use crate::models::CaseDay;

const TEST_FRACTION: f64 = 0.3;
const CV_FOLDS: usize = 5;
const LABEL_QUANTILE: f64 = 0.6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
}

/// Evaluation results persisted alongside the model and served back by the
/// metrics endpoint. The schema is part of the artifact contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub auc_roc: f64,
    pub train_accuracy: f64,
    pub overfitting_gap: f64,
    pub cv_mean: f64,
    pub cv_std: f64,
    /// [[tn, fp], [fn, tp]]
    pub confusion_matrix: [[u64; 2]; 2],
    pub roc_curve: RocCurve,
    pub feature_importance: Vec<FeatureImportance>,
    pub mortality_threshold: f64,
    pub training_samples: usize,
    pub test_samples: usize,
}

/// The four pieces the training job emits and the serving path loads.
#[derive(Debug, Clone)]
pub struct TrainedArtifact {
    pub forest: RandomForest,
    pub scaler: Scaler,
    pub feature_columns: Vec<String>,
    pub metrics: ModelMetrics,
}

/// Engineer the full corpus from a (country, date)-ordered series by
/// splitting it into per-country runs.
pub fn engineer_corpus(series: &[CaseDay]) -> Vec<TrainingRow> {
    let mut rows = Vec::new();
    let mut start = 0;
    for i in 1..=series.len() {
        if i == series.len() || series[i].country != series[start].country {
            rows.extend(build_training_rows(&series[start..i]));
            start = i;
        }
    }
    rows
}

/// Offline training batch: label via the corpus 60th-percentile mortality
/// threshold, scale, stratified 70/30 split, cross-validated AUC on the
/// training split, then a held-out evaluation of the final forest.
pub fn train(series: &[CaseDay], config: ForestConfig) -> anyhow::Result<TrainedArtifact> {
    let rows = engineer_corpus(series);
    anyhow::ensure!(
        rows.len() >= 20,
        "not enough engineered rows to train on ({} after dropping short histories)",
        rows.len()
    );
    info!("engineered {} training rows", rows.len());

    let rates: Vec<f64> = rows.iter().map(|r| r.mortality_rate).collect();
    let threshold = percentile(&rates, LABEL_QUANTILE);
    let labels: Vec<bool> = rates.iter().map(|r| *r > threshold).collect();
    let positives = labels.iter().filter(|l| **l).count();
    info!(
        "mortality threshold (60th percentile) {:.2}%; {} of {} rows high-risk",
        threshold,
        positives,
        labels.len()
    );

    let x: Vec<Vec<f64>> = rows.into_iter().map(|r| r.features).collect();
    let scaler = Scaler::fit(&x);
    let x = scaler.transform_rows(&x)?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let (train_idx, test_idx) = stratified_split(&labels, TEST_FRACTION, &mut rng);
    info!("split: {} train / {} test", train_idx.len(), test_idx.len());

    let subset = |idx: &[usize]| -> (Vec<Vec<f64>>, Vec<bool>) {
        (
            idx.iter().map(|&i| x[i].clone()).collect(),
            idx.iter().map(|&i| labels[i]).collect(),
        )
    };
    let (x_train, y_train) = subset(&train_idx);
    let (x_test, y_test) = subset(&test_idx);

    let cv_scores = cross_validated_auc(&x_train, &y_train, CV_FOLDS, &config, &mut rng)?;
    let cv_mean = cv_scores.iter().sum::<f64>() / cv_scores.len() as f64;
    let cv_std = (cv_scores
        .iter()
        .map(|s| (s - cv_mean) * (s - cv_mean))
        .sum::<f64>()
        / cv_scores.len() as f64)
        .sqrt();
    info!("{CV_FOLDS}-fold CV AUC {cv_mean:.4} (+/- {:.4})", cv_std * 2.0);

    let forest = RandomForest::fit(&x_train, &y_train, config);

    let score_all = |rows: &[Vec<f64>]| -> anyhow::Result<Vec<f64>> {
        rows.iter()
            .map(|r| forest.predict_proba(r).map_err(Into::into))
            .collect()
    };
    let train_scores = score_all(&x_train)?;
    let test_scores = score_all(&x_test)?;
    let train_pred: Vec<bool> = train_scores.iter().map(|s| *s > 0.5).collect();
    let test_pred: Vec<bool> = test_scores.iter().map(|s| *s > 0.5).collect();

    let train_accuracy = accuracy(&y_train, &train_pred);
    let test_accuracy = accuracy(&y_test, &test_pred);
    let cm = confusion_matrix(&y_test, &test_pred);
    let (precision, recall, f1_score) = precision_recall_f1(&cm);
    let auc_roc = auc(&y_test, &test_scores);
    info!("test accuracy {test_accuracy:.4}, AUC {auc_roc:.4}");

    let mut feature_importance: Vec<FeatureImportance> = FEATURE_COLUMNS
        .iter()
        .zip(&forest.feature_importances)
        .map(|(feature, importance)| FeatureImportance {
            feature: feature.to_string(),
            importance: *importance,
        })
        .collect();
    feature_importance.sort_by(|a, b| {
        b.importance
            .partial_cmp(&a.importance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let metrics = ModelMetrics {
        accuracy: test_accuracy,
        precision,
        recall,
        f1_score,
        auc_roc,
        train_accuracy,
        overfitting_gap: train_accuracy - test_accuracy,
        cv_mean,
        cv_std,
        confusion_matrix: cm,
        roc_curve: roc_curve(&y_test, &test_scores),
        feature_importance,
        mortality_threshold: threshold,
        training_samples: train_idx.len(),
        test_samples: test_idx.len(),
    };

    Ok(TrainedArtifact {
        forest,
        scaler,
        feature_columns: FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
        metrics,
    })
}

/// Shuffle each class separately and carve off `test_fraction` of it, so
/// both splits keep the corpus class balance.
fn stratified_split(
    labels: &[bool],
    test_fraction: f64,
    rng: &mut StdRng,
) -> (Vec<usize>, Vec<usize>) {
    let mut train = Vec::new();
    let mut test = Vec::new();
    for class in [false, true] {
        let mut idx: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        idx.shuffle(rng);
        let n_test = (idx.len() as f64 * test_fraction).round() as usize;
        test.extend_from_slice(&idx[..n_test]);
        train.extend_from_slice(&idx[n_test..]);
    }
    (train, test)
}

/// Stratified k-fold AUC over the training split.
fn cross_validated_auc(
    x: &[Vec<f64>],
    y: &[bool],
    k: usize,
    config: &ForestConfig,
    rng: &mut StdRng,
) -> anyhow::Result<Vec<f64>> {
    // Round-robin class members into folds after a shuffle.
    let mut fold_of = vec![0usize; y.len()];
    for class in [false, true] {
        let mut idx: Vec<usize> = (0..y.len()).filter(|&i| y[i] == class).collect();
        idx.shuffle(rng);
        for (pos, i) in idx.into_iter().enumerate() {
            fold_of[i] = pos % k;
        }
    }

    let mut scores = Vec::with_capacity(k);
    for fold in 0..k {
        let mut x_fit = Vec::new();
        let mut y_fit = Vec::new();
        let mut x_val = Vec::new();
        let mut y_val = Vec::new();
        for i in 0..y.len() {
            if fold_of[i] == fold {
                x_val.push(x[i].clone());
                y_val.push(y[i]);
            } else {
                x_fit.push(x[i].clone());
                y_fit.push(y[i]);
            }
        }
        let forest = RandomForest::fit(&x_fit, &y_fit, config.clone());
        let val_scores: Vec<f64> = x_val
            .iter()
            .map(|r| forest.predict_proba(r))
            .collect::<Result<_, _>>()?;
        scores.push(auc(&y_val, &val_scores));
    }
    Ok(scores)
}

pub fn accuracy(truth: &[bool], pred: &[bool]) -> f64 {
    if truth.is_empty() {
        return 0.0;
    }
    let hits = truth.iter().zip(pred).filter(|(t, p)| t == p).count();
    hits as f64 / truth.len() as f64
}

/// [[tn, fp], [fn, tp]]
pub fn confusion_matrix(truth: &[bool], pred: &[bool]) -> [[u64; 2]; 2] {
    let mut cm = [[0u64; 2]; 2];
    for (t, p) in truth.iter().zip(pred) {
        cm[*t as usize][*p as usize] += 1;
    }
    cm
}

/// Precision/recall/F1 for the positive class, 0 on zero denominators.
pub fn precision_recall_f1(cm: &[[u64; 2]; 2]) -> (f64, f64, f64) {
    let tp = cm[1][1] as f64;
    let fp = cm[0][1] as f64;
    let fn_ = cm[1][0] as f64;
    let precision = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
    let recall = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };
    (precision, recall, f1)
}

/// Rank-based AUC (Mann-Whitney) with average ranks on ties; 0.5 when a
/// class is absent.
pub fn auc(truth: &[bool], scores: &[f64]) -> f64 {
    let n_pos = truth.iter().filter(|t| **t).count();
    let n_neg = truth.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..truth.len()).collect();
    order.sort_by(|&a, &b| {
        scores[a]
            .partial_cmp(&scores[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if truth[idx] {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }

    let n_pos = n_pos as f64;
    (rank_sum_pos - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64)
}

/// ROC points from high threshold to low, anchored at (0,0) and (1,1).
pub fn roc_curve(truth: &[bool], scores: &[f64]) -> RocCurve {
    let n_pos = truth.iter().filter(|t| **t).count() as f64;
    let n_neg = truth.len() as f64 - n_pos;

    let mut order: Vec<usize> = (0..truth.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    let mut tp = 0.0;
    let mut fp = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        for &idx in &order[i..=j] {
            if truth[idx] {
                tp += 1.0;
            } else {
                fp += 1.0;
            }
        }
        fpr.push(if n_neg > 0.0 { fp / n_neg } else { 0.0 });
        tpr.push(if n_pos > 0.0 { tp / n_pos } else { 0.0 });
        i = j + 1;
    }

    RocCurve { fpr, tpr }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;

    /// Synthetic corpus: several countries with distinct, stable mortality
    /// profiles and enough history to survive the lag/rolling drop.
    pub(crate) fn synthetic_corpus() -> Vec<CaseDay> {
        let start = NaiveDate::from_ymd_opt(2020, 3, 2).unwrap();
        let profiles: [(&str, &str, f64); 5] = [
            ("Alphaland", "Europe", 0.01),
            ("Betania", "Americas", 0.03),
            ("Gammastan", "Africa", 0.06),
            ("Deltora", "South-East Asia", 0.09),
            ("Epsilia", "Western Pacific", 0.12),
        ];
        let mut series = Vec::new();
        for (country, region, fatality) in profiles {
            for day in 0..40i64 {
                let confirmed = 500 + day * 37 + (day * day) / 3;
                let deaths = (confirmed as f64 * fatality) as i64;
                let recovered = confirmed / 4 + day;
                series.push(CaseDay {
                    country: country.to_string(),
                    date: start + chrono::Duration::days(day),
                    confirmed,
                    deaths,
                    recovered,
                    active: confirmed - deaths - recovered,
                    who_region: region.to_string(),
                });
            }
        }
        series
    }

    pub(crate) fn fast_config() -> ForestConfig {
        ForestConfig {
            n_trees: 12,
            max_depth: 4,
            min_samples_split: 10,
            min_samples_leaf: 5,
            max_samples: 0.7,
            seed: 42,
        }
    }

    #[test]
    fn threshold_is_recomputed_from_the_corpus() {
        let series = synthetic_corpus();
        let rows = engineer_corpus(&series);
        let rates: Vec<f64> = rows.iter().map(|r| r.mortality_rate).collect();
        let expected = percentile(&rates, 0.6);

        let artifact = train(&series, fast_config()).unwrap();
        assert!((artifact.metrics.mortality_threshold - expected).abs() < 1e-9);
        // Five flat mortality profiles: the 60th percentile sits between the
        // third and fourth, so roughly two in five rows are high-risk.
        assert!(expected > 3.0 && expected < 9.0, "threshold {expected}");
    }

    #[test]
    fn split_is_stratified_and_sized() {
        let labels: Vec<bool> = (0..100).map(|i| i % 5 == 0).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let (train_idx, test_idx) = stratified_split(&labels, 0.3, &mut rng);
        assert_eq!(train_idx.len() + test_idx.len(), 100);
        assert_eq!(test_idx.len(), 30);
        let test_pos = test_idx.iter().filter(|&&i| labels[i]).count();
        assert_eq!(test_pos, 6); // 30% of the 20 positives
    }

    #[test]
    fn auc_is_one_for_perfect_ranking_and_half_for_constant() {
        let truth = vec![false, false, true, true];
        assert!((auc(&truth, &[0.1, 0.2, 0.8, 0.9]) - 1.0).abs() < 1e-12);
        assert!((auc(&truth, &[0.5, 0.5, 0.5, 0.5]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn precision_recall_tolerate_empty_positive_predictions() {
        let cm = confusion_matrix(&[true, false, false], &[false, false, false]);
        let (precision, recall, f1) = precision_recall_f1(&cm);
        assert_eq!(precision, 0.0);
        assert_eq!(recall, 0.0);
        assert_eq!(f1, 0.0);
    }

    #[test]
    fn roc_curve_is_monotonic_and_anchored() {
        let truth = vec![true, false, true, false, true];
        let scores = vec![0.9, 0.8, 0.7, 0.3, 0.2];
        let curve = roc_curve(&truth, &scores);
        assert_eq!((curve.fpr[0], curve.tpr[0]), (0.0, 0.0));
        assert_eq!(
            (*curve.fpr.last().unwrap(), *curve.tpr.last().unwrap()),
            (1.0, 1.0)
        );
        assert!(curve.fpr.windows(2).all(|w| w[0] <= w[1]));
        assert!(curve.tpr.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn training_persists_the_feature_schema_in_order() {
        let artifact = train(&synthetic_corpus(), fast_config()).unwrap();
        assert_eq!(artifact.feature_columns.len(), 19);
        assert_eq!(artifact.feature_columns[0], "confirmed_lag2");
        assert_eq!(artifact.feature_columns[18], "log_recovered_lag2");
        assert_eq!(
            artifact.metrics.training_samples + artifact.metrics.test_samples,
            engineer_corpus(&synthetic_corpus()).len()
        );
    }
}
