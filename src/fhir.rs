use chrono::Utc;
use serde_json::{json, Value};

use crate::models::ObservationRow;

/// Map one aggregate row onto a FHIR R4 Observation. The vocabulary is
/// fixed: LOINC 94500-6 for the confirmed-cases panel, 64518-6 and 82810-3
/// for the deaths and recovered components.
pub fn observation(row: &ObservationRow) -> Value {
    let country_ref = row.country.replace(' ', "-");
    json!({
        "resourceType": "Observation",
        "id": format!("covid-{}-{}", country_ref, row.date),
        "status": "final",
        "category": [{
            "coding": [{
                "system": "http://terminology.hl7.org/CodeSystem/observation-category",
                "code": "laboratory",
                "display": "Laboratory"
            }]
        }],
        "code": {
            "coding": [{
                "system": "http://loinc.org",
                "code": "94500-6",
                "display": "SARS-CoV-2 RNA Pnl Respiratory specimen by NAA with probe detection"
            }],
            "text": "COVID-19 Test"
        },
        "subject": {
            "reference": format!("Location/{country_ref}"),
            "display": row.country
        },
        "effectiveDateTime": row.date.to_string(),
        "issued": Utc::now().to_rfc3339(),
        "valueQuantity": {
            "value": row.confirmed,
            "unit": "cases",
            "system": "http://unitsofmeasure.org",
            "code": "{cases}"
        },
        "component": [
            {
                "code": {
                    "coding": [{
                        "system": "http://loinc.org",
                        "code": "64518-6",
                        "display": "Deaths"
                    }],
                    "text": "COVID-19 Deaths"
                },
                "valueQuantity": { "value": row.deaths, "unit": "deaths" }
            },
            {
                "code": {
                    "coding": [{
                        "system": "http://loinc.org",
                        "code": "82810-3",
                        "display": "Recovered"
                    }],
                    "text": "COVID-19 Recovered"
                },
                "valueQuantity": { "value": row.recovered, "unit": "recovered" }
            }
        ]
    })
}

/// FHIR error envelope for required-parameter and not-found outcomes.
pub fn operation_outcome(code: &str, diagnostics: &str) -> Value {
    json!({
        "resourceType": "OperationOutcome",
        "issue": [{
            "severity": "error",
            "code": code,
            "diagnostics": diagnostics
        }]
    })
}

/// Static description of the Observation read/search surface.
pub fn capability_statement() -> Value {
    json!({
        "resourceType": "CapabilityStatement",
        "status": "active",
        "date": Utc::now().to_rfc3339(),
        "publisher": "covid-risk-watch",
        "kind": "instance",
        "software": {
            "name": "COVID-19 Surveillance API",
            "version": env!("CARGO_PKG_VERSION")
        },
        "implementation": {
            "description": "FHIR-compatible view of COVID-19 surveillance data"
        },
        "fhirVersion": "4.0.1",
        "format": ["json"],
        "rest": [{
            "mode": "server",
            "resource": [{
                "type": "Observation",
                "interaction": [
                    { "code": "read" },
                    { "code": "search-type" }
                ],
                "searchParam": [
                    { "name": "country", "type": "string" },
                    { "name": "date", "type": "date" }
                ]
            }]
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_row() -> ObservationRow {
        ObservationRow {
            country: "New Zealand".to_string(),
            date: NaiveDate::from_ymd_opt(2020, 7, 1).unwrap(),
            confirmed: 1530,
            deaths: 22,
            recovered: 1490,
            latitude: Some(-40.9),
            longitude: Some(174.886),
        }
    }

    #[test]
    fn observation_carries_fixed_vocabulary_and_counts() {
        let obs = observation(&sample_row());
        assert_eq!(obs["resourceType"], "Observation");
        assert_eq!(obs["id"], "covid-New-Zealand-2020-07-01");
        assert_eq!(obs["code"]["coding"][0]["code"], "94500-6");
        assert_eq!(obs["valueQuantity"]["value"], 1530);
        assert_eq!(obs["component"][0]["code"]["coding"][0]["code"], "64518-6");
        assert_eq!(obs["component"][0]["valueQuantity"]["value"], 22);
        assert_eq!(obs["component"][1]["code"]["coding"][0]["code"], "82810-3");
        assert_eq!(obs["component"][1]["valueQuantity"]["value"], 1490);
        assert_eq!(obs["subject"]["reference"], "Location/New-Zealand");
    }

    #[test]
    fn outcome_reports_code_and_diagnostics() {
        let outcome = operation_outcome("not-found", "No data for Atlantis on 2020-07-01");
        assert_eq!(outcome["resourceType"], "OperationOutcome");
        assert_eq!(outcome["issue"][0]["code"], "not-found");
        assert_eq!(outcome["issue"][0]["severity"], "error");
    }

    #[test]
    fn capability_statement_describes_observation_search() {
        let cap = capability_statement();
        assert_eq!(cap["fhirVersion"], "4.0.1");
        assert_eq!(cap["rest"][0]["resource"][0]["type"], "Observation");
        assert_eq!(
            cap["rest"][0]["resource"][0]["searchParam"][0]["name"],
            "country"
        );
    }
}
