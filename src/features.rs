use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::error::PredictError;
use crate::models::{mortality_rate, CaseDay};

/// Ordered feature schema shared by training and inference. The order is the
/// contract: the trained model records it, and any reordering silently
/// corrupts predictions downstream.
pub const FEATURE_COLUMNS: [&str; 19] = [
    "confirmed_lag2",
    "deaths_lag2",
    "recovered_lag2",
    "active_lag2",
    "confirmed_change_2d",
    "deaths_change_2d",
    "recovered_change_2d",
    "confirmed_rolling_14d",
    "deaths_rolling_14d",
    "recovered_rolling_14d",
    "confirmed_volatility",
    "deaths_volatility",
    "confirmed_acceleration",
    "day_of_week",
    "days_since_first",
    "who_region_encoded",
    "log_confirmed_lag2",
    "log_deaths_lag2",
    "log_recovered_lag2",
];

const ROLLING_MEAN_WINDOW: usize = 14;
const VOLATILITY_WINDOW: usize = 7;
const MIN_WINDOW_OBS: usize = 3;
const LAG: usize = 2;

/// Fixed mapping from the six named WHO regions to integer codes, with a
/// seventh bucket for blank or unrecognized regions.
pub fn encode_who_region(region: &str) -> f64 {
    match region {
        "Americas" => 0.0,
        "Europe" => 1.0,
        "Western Pacific" => 2.0,
        "Eastern Mediterranean" => 3.0,
        "South-East Asia" => 4.0,
        "Africa" => 5.0,
        _ => 6.0,
    }
}

/// One engineered training row plus the raw mortality rate the label is
/// derived from.
#[derive(Debug, Clone)]
pub struct TrainingRow {
    pub features: Vec<f64>,
    pub mortality_rate: f64,
}

/// Engineer training rows from one country's chronologically ordered series.
///
/// The first two rows per country lack the 2-day lag and are dropped, which
/// biases the corpus toward longer-running outbreaks. That survivorship bias
/// is a known limitation of the source data pipeline and is kept, not fixed.
pub fn build_training_rows(series: &[CaseDay]) -> Vec<TrainingRow> {
    let confirmed: Vec<f64> = series.iter().map(|d| d.confirmed as f64).collect();
    let deaths: Vec<f64> = series.iter().map(|d| d.deaths as f64).collect();
    let recovered: Vec<f64> = series.iter().map(|d| d.recovered as f64).collect();
    let active: Vec<f64> = series.iter().map(|d| d.active as f64).collect();

    // 2-day deltas, 0 where the lag is undefined; volatility and
    // acceleration are computed over these.
    let delta = |values: &[f64]| -> Vec<f64> {
        (0..values.len())
            .map(|i| if i >= LAG { values[i] - values[i - LAG] } else { 0.0 })
            .collect()
    };
    let confirmed_delta = delta(&confirmed);
    let deaths_delta = delta(&deaths);

    let mut rows = Vec::new();
    for i in 0..series.len() {
        if i < LAG {
            continue;
        }

        let day = &series[i];
        let confirmed_lag2 = confirmed[i - LAG];
        let deaths_lag2 = deaths[i - LAG];
        let recovered_lag2 = recovered[i - LAG];
        let active_lag2 = active[i - LAG];

        let features = vec![
            confirmed_lag2,
            deaths_lag2,
            recovered_lag2,
            active_lag2,
            confirmed_delta[i],
            deaths_delta[i],
            recovered[i] - recovered_lag2,
            trailing_mean(&confirmed, i, ROLLING_MEAN_WINDOW),
            trailing_mean(&deaths, i, ROLLING_MEAN_WINDOW),
            trailing_mean(&recovered, i, ROLLING_MEAN_WINDOW),
            trailing_std(&confirmed_delta, i, VOLATILITY_WINDOW),
            trailing_std(&deaths_delta, i, VOLATILITY_WINDOW),
            if i >= 1 { confirmed_delta[i] - confirmed_delta[i - 1] } else { 0.0 },
            day.date.weekday().num_days_from_monday() as f64,
            i as f64,
            encode_who_region(&day.who_region),
            confirmed_lag2.ln_1p(),
            deaths_lag2.ln_1p(),
            recovered_lag2.ln_1p(),
        ];

        rows.push(TrainingRow {
            features,
            mortality_rate: mortality_rate(deaths[i], confirmed[i]),
        });
    }
    rows
}

/// Trailing mean over at most `window` observations ending at `i`,
/// inclusive. Requires at least MIN_WINDOW_OBS observations; callers only
/// reach this once the lag requirement already guarantees that.
fn trailing_mean(values: &[f64], i: usize, window: usize) -> f64 {
    let start = (i + 1).saturating_sub(window);
    let slice = &values[start..=i];
    slice.iter().sum::<f64>() / slice.len() as f64
}

/// Trailing sample standard deviation over at most `window` observations
/// ending at `i`, inclusive; 0 when fewer than MIN_WINDOW_OBS are available.
fn trailing_std(values: &[f64], i: usize, window: usize) -> f64 {
    let start = (i + 1).saturating_sub(window);
    let slice = &values[start..=i];
    if slice.len() < MIN_WINDOW_OBS {
        return 0.0;
    }
    let mean = slice.iter().sum::<f64>() / slice.len() as f64;
    let var = slice.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>()
        / (slice.len() - 1) as f64;
    var.sqrt()
}

/// Linearly interpolated percentile, `q` in [0, 1]. The mortality threshold
/// is always recomputed from the supplied corpus with this, never hard-coded.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
    }
}

/// A partial case snapshot supplied at inference time. Only `confirmed` and
/// `deaths` are required; every historical field falls back to a documented
/// heuristic extrapolation. The heuristics (0.92 lag factor, half-delta
/// volatility, tenth-delta acceleration) come from the upstream data
/// pipeline and are preserved as defaults, not corrected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Snapshot {
    pub confirmed: Option<f64>,
    pub deaths: Option<f64>,
    pub recovered: Option<f64>,
    pub active: Option<f64>,
    pub confirmed_lag2: Option<f64>,
    pub deaths_lag2: Option<f64>,
    pub recovered_lag2: Option<f64>,
    pub active_lag2: Option<f64>,
    pub confirmed_rolling_14d: Option<f64>,
    pub deaths_rolling_14d: Option<f64>,
    pub recovered_rolling_14d: Option<f64>,
    pub confirmed_volatility: Option<f64>,
    pub deaths_volatility: Option<f64>,
    pub confirmed_acceleration: Option<f64>,
    pub day_of_week: Option<f64>,
    pub days_since_first: Option<f64>,
    pub who_region_encoded: Option<f64>,
}

const LAG_HEURISTIC: f64 = 0.92;

impl Snapshot {
    /// Build the 19-element vector in FEATURE_COLUMNS order. Fails before
    /// any computation if a required field is absent.
    pub fn feature_vector(&self) -> Result<Vec<f64>, PredictError> {
        let mut missing = Vec::new();
        if self.confirmed.is_none() {
            missing.push("confirmed");
        }
        if self.deaths.is_none() {
            missing.push("deaths");
        }
        if !missing.is_empty() {
            return Err(PredictError::MissingFields(missing.join(", ")));
        }

        let confirmed = self.confirmed.unwrap_or(0.0);
        let deaths = self.deaths.unwrap_or(0.0);
        let recovered = self.recovered.unwrap_or(0.0);
        let active = self.active.unwrap_or(confirmed - deaths - recovered);

        let confirmed_lag2 = self.confirmed_lag2.unwrap_or(confirmed * LAG_HEURISTIC);
        let deaths_lag2 = self.deaths_lag2.unwrap_or(deaths * LAG_HEURISTIC);
        let recovered_lag2 = self.recovered_lag2.unwrap_or(recovered * LAG_HEURISTIC);
        let active_lag2 = self.active_lag2.unwrap_or(active * LAG_HEURISTIC);

        let confirmed_change_2d = confirmed - confirmed_lag2;
        let deaths_change_2d = deaths - deaths_lag2;
        let recovered_change_2d = recovered - recovered_lag2;

        Ok(vec![
            confirmed_lag2,
            deaths_lag2,
            recovered_lag2,
            active_lag2,
            confirmed_change_2d,
            deaths_change_2d,
            recovered_change_2d,
            self.confirmed_rolling_14d.unwrap_or(confirmed),
            self.deaths_rolling_14d.unwrap_or(deaths),
            self.recovered_rolling_14d.unwrap_or(recovered),
            self.confirmed_volatility
                .unwrap_or(confirmed_change_2d.abs() * 0.5),
            self.deaths_volatility.unwrap_or(deaths_change_2d.abs() * 0.5),
            self.confirmed_acceleration.unwrap_or(confirmed_change_2d * 0.1),
            self.day_of_week.unwrap_or(3.0),
            self.days_since_first.unwrap_or(30.0),
            self.who_region_encoded.unwrap_or(0.0),
            confirmed_lag2.ln_1p(),
            deaths_lag2.ln_1p(),
            recovered_lag2.ln_1p(),
        ])
    }

    /// Mortality rate recomputed from the raw snapshot, not the model.
    pub fn mortality_rate(&self) -> f64 {
        mortality_rate(self.deaths.unwrap_or(0.0), self.confirmed.unwrap_or(0.0))
    }
}

/// Per-column standardization fitted at training time and persisted with the
/// model; the identical transform is applied at inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl Scaler {
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let n_cols = rows.first().map_or(0, |r| r.len());
        let n = rows.len() as f64;
        let mut mean = vec![0.0; n_cols];
        for row in rows {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= n;
        }

        let mut scale = vec![0.0; n_cols];
        for row in rows {
            for (s, (v, m)) in scale.iter_mut().zip(row.iter().zip(&mean)) {
                *s += (v - m) * (v - m);
            }
        }
        for s in &mut scale {
            *s = (*s / n).sqrt();
            // Constant columns pass through unscaled.
            if *s == 0.0 {
                *s = 1.0;
            }
        }

        Scaler { mean, scale }
    }

    pub fn transform(&self, row: &[f64]) -> Result<Vec<f64>, PredictError> {
        if row.len() != self.mean.len() {
            return Err(PredictError::SchemaMismatch {
                expected: self.mean.len(),
                actual: row.len(),
            });
        }
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(v, (m, s))| (v - m) / s)
            .collect())
    }

    pub fn transform_rows(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, PredictError> {
        rows.iter().map(|r| self.transform(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(country: &str, offset: u64, confirmed: i64, deaths: i64, recovered: i64) -> CaseDay {
        let date = NaiveDate::from_ymd_opt(2020, 3, 2).unwrap() + chrono::Duration::days(offset as i64);
        CaseDay {
            country: country.to_string(),
            date,
            confirmed,
            deaths,
            recovered,
            active: confirmed - deaths - recovered,
            who_region: "Europe".to_string(),
        }
    }

    #[test]
    fn missing_required_fields_are_rejected_by_name() {
        let snapshot = Snapshot {
            recovered: Some(10.0),
            ..Snapshot::default()
        };
        let err = snapshot.feature_vector().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("confirmed"), "{message}");
        assert!(message.contains("deaths"), "{message}");
    }

    #[test]
    fn zero_confirmed_yields_zero_mortality() {
        let snapshot = Snapshot {
            confirmed: Some(0.0),
            deaths: Some(25.0),
            ..Snapshot::default()
        };
        assert_eq!(snapshot.mortality_rate(), 0.0);
        assert!(snapshot.feature_vector().is_ok());
    }

    #[test]
    fn heuristic_defaults_are_applied_consistently() {
        let snapshot = Snapshot {
            confirmed: Some(1000.0),
            deaths: Some(50.0),
            ..Snapshot::default()
        };
        let v = snapshot.feature_vector().unwrap();
        assert_eq!(v.len(), FEATURE_COLUMNS.len());
        assert!((v[0] - 920.0).abs() < 1e-9); // confirmed_lag2 = 0.92 * 1000
        assert!((v[4] - 80.0).abs() < 1e-9); // confirmed_change_2d
        assert!((v[7] - 1000.0).abs() < 1e-9); // rolling mean defaults to current
        assert!((v[10] - 40.0).abs() < 1e-9); // volatility = half the delta
        assert!((v[12] - 8.0).abs() < 1e-9); // acceleration = tenth of delta
        assert_eq!(v[13], 3.0);
        assert_eq!(v[14], 30.0);
        assert!((v[16] - 921.0_f64.ln()).abs() < 1e-9); // log1p of lag
    }

    #[test]
    fn identical_snapshots_yield_bit_identical_vectors() {
        let snapshot = Snapshot {
            confirmed: Some(12345.0),
            deaths: Some(678.0),
            recovered: Some(9000.0),
            ..Snapshot::default()
        };
        let a = snapshot.feature_vector().unwrap();
        let b = snapshot.feature_vector().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn region_codes_cover_all_buckets() {
        assert_eq!(encode_who_region("Americas"), 0.0);
        assert_eq!(encode_who_region("Europe"), 1.0);
        assert_eq!(encode_who_region("Western Pacific"), 2.0);
        assert_eq!(encode_who_region("Eastern Mediterranean"), 3.0);
        assert_eq!(encode_who_region("South-East Asia"), 4.0);
        assert_eq!(encode_who_region("Africa"), 5.0);
        assert_eq!(encode_who_region(""), 6.0);
        assert_eq!(encode_who_region("Atlantis"), 6.0);
    }

    #[test]
    fn first_two_rows_are_dropped_from_training() {
        let series: Vec<CaseDay> = (0..10)
            .map(|i| day("Norway", i, 100 + 10 * i as i64, i as i64, 2 * i as i64))
            .collect();
        let rows = build_training_rows(&series);
        assert_eq!(rows.len(), 8);
        // First surviving row sees the lag from index 0.
        assert_eq!(rows[0].features[0], 100.0);
        assert_eq!(rows[0].features[14], 2.0); // days_since_first
    }

    #[test]
    fn trailing_stats_respect_window_and_floor() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((trailing_mean(&values, 4, 3) - 4.0).abs() < 1e-12);
        assert_eq!(trailing_std(&values, 1, 7), 0.0); // only 2 observations
        // std of [1,2,3] with ddof 1 is 1
        assert!((trailing_std(&values, 2, 7) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let values: Vec<f64> = (0..=10).map(f64::from).collect();
        assert!((percentile(&values, 0.6) - 6.0).abs() < 1e-12);
        let values = vec![1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&values, 0.6) - 2.8).abs() < 1e-12);
    }

    #[test]
    fn scaler_passes_constant_columns_through() {
        let rows = vec![vec![5.0, 1.0], vec![5.0, 3.0]];
        let scaler = Scaler::fit(&rows);
        let out = scaler.transform(&[5.0, 2.0]).unwrap();
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn scaler_rejects_wrong_width() {
        let scaler = Scaler::fit(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        let err = scaler.transform(&[1.0]).unwrap_err();
        assert!(err.to_string().contains("schema mismatch"));
    }
}
