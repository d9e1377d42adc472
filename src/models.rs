use chrono::NaiveDate;
use serde::Serialize;

/// One country's totals for a single date, summed over provinces.
/// `active` is derived upstream as confirmed - deaths - recovered and may
/// be negative in source data; callers must tolerate that.
#[derive(Debug, Clone, Serialize)]
pub struct CaseDay {
    pub country: String,
    pub date: NaiveDate,
    pub confirmed: i64,
    pub deaths: i64,
    pub recovered: i64,
    pub active: i64,
    pub who_region: String,
}

/// Global per-date rollup, rebuilt wholesale by the ETL.
#[derive(Debug, Clone, Serialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub total_confirmed: i64,
    pub total_deaths: i64,
    pub total_recovered: i64,
    pub total_active: i64,
    pub daily_new_cases: i64,
    pub daily_new_deaths: i64,
    pub global_mortality_rate: f64,
    pub global_recovery_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionRollup {
    pub region: String,
    pub confirmed: i64,
    pub deaths: i64,
    pub recovered: i64,
    pub active: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CountryRanking {
    pub country: String,
    pub confirmed: i64,
    pub deaths: i64,
    pub recovered: i64,
    pub active: i64,
    pub mortality_rate: f64,
}

/// Row backing one FHIR Observation: a country's totals on one date plus
/// whatever coordinates the source carried.
#[derive(Debug, Clone)]
pub struct ObservationRow {
    pub country: String,
    pub date: NaiveDate,
    pub confirmed: i64,
    pub deaths: i64,
    pub recovered: i64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// deaths / confirmed * 100, defined as 0 when confirmed is not positive.
pub fn mortality_rate(deaths: f64, confirmed: f64) -> f64 {
    if confirmed > 0.0 {
        deaths / confirmed * 100.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskLevel {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "HIGH")]
    High,
}

impl RiskLevel {
    /// Band a scored probability: LOW <= 0.4 < MEDIUM <= 0.7 < HIGH.
    pub fn from_score(score: f64) -> Self {
        if score > 0.7 {
            RiskLevel::High
        } else if score > 0.4 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            RiskLevel::High => "red",
            RiskLevel::Medium => "orange",
            RiskLevel::Low => "green",
        }
    }

    /// Fixed advisory text per band; part of the observable contract.
    pub fn advisory(self) -> &'static str {
        match self {
            RiskLevel::High => {
                "High mortality risk detected. Enhanced surveillance and resource \
                 allocation recommended. Implement aggressive public health interventions."
            }
            RiskLevel::Medium => {
                "Moderate mortality risk. Continue monitoring outbreak patterns closely. \
                 Prepare contingency plans and ensure healthcare capacity."
            }
            RiskLevel::Low => {
                "Low mortality risk. Maintain standard surveillance protocols. \
                 Continue preventive measures and public health education."
            }
        }
    }
}

/// Output of one inference call. Ephemeral, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub prediction: i32,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub risk_color: &'static str,
    pub confidence: f64,
    pub recommendation: &'static str,
    pub mortality_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banding_is_a_step_function_of_score() {
        assert_eq!(RiskLevel::from_score(0.10), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.55), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.75), RiskLevel::High);
    }

    #[test]
    fn band_boundaries_are_inclusive_below() {
        assert_eq!(RiskLevel::from_score(0.4), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.7), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.7000001), RiskLevel::High);
    }

    #[test]
    fn mortality_rate_handles_zero_confirmed() {
        assert_eq!(mortality_rate(50.0, 0.0), 0.0);
        assert!((mortality_rate(50.0, 1000.0) - 5.0).abs() < 1e-12);
    }
}
