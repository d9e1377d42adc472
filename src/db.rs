use anyhow::Context;
use chrono::NaiveDate;
use log::info;
use sqlx::{Row, SqlitePool};

use crate::models::{
    mortality_rate, CaseDay, CountryRanking, DailyAggregate, ObservationRow, RegionRollup,
};

pub async fn init_db(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daily_cases (
            province_state TEXT NOT NULL DEFAULT '',
            country_region TEXT NOT NULL,
            latitude REAL,
            longitude REAL,
            date TEXT NOT NULL,
            confirmed INTEGER NOT NULL DEFAULT 0,
            deaths INTEGER NOT NULL DEFAULT 0,
            recovered INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 0,
            who_region TEXT NOT NULL DEFAULT '',
            UNIQUE (country_region, province_state, date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dashboard_metrics (
            date TEXT PRIMARY KEY,
            total_confirmed INTEGER NOT NULL,
            total_deaths INTEGER NOT NULL,
            total_recovered INTEGER NOT NULL,
            total_active INTEGER NOT NULL,
            daily_new_cases INTEGER NOT NULL,
            daily_new_deaths INTEGER NOT NULL,
            global_mortality_rate REAL NOT NULL,
            global_recovery_rate REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn upsert_case(
    pool: &SqlitePool,
    province: &str,
    country: &str,
    latitude: Option<f64>,
    longitude: Option<f64>,
    date: NaiveDate,
    confirmed: i64,
    deaths: i64,
    recovered: i64,
    who_region: &str,
) -> anyhow::Result<()> {
    // `active` is derived, not clamped: negative values are permitted data.
    let active = confirmed - deaths - recovered;
    sqlx::query(
        r#"
        INSERT INTO daily_cases
        (province_state, country_region, latitude, longitude, date,
         confirmed, deaths, recovered, active, who_region)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (country_region, province_state, date) DO UPDATE
        SET confirmed = excluded.confirmed,
            deaths = excluded.deaths,
            recovered = excluded.recovered,
            active = excluded.active,
            who_region = excluded.who_region,
            latitude = excluded.latitude,
            longitude = excluded.longitude
        "#,
    )
    .bind(province)
    .bind(country)
    .bind(latitude)
    .bind(longitude)
    .bind(date)
    .bind(confirmed)
    .bind(deaths)
    .bind(recovered)
    .bind(active)
    .bind(who_region)
    .execute(pool)
    .await?;
    Ok(())
}

/// Batch-load the per-province daily case CSV and rebuild the aggregate
/// table. Returns the number of rows ingested.
pub async fn import_csv(pool: &SqlitePool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        #[serde(rename = "Province/State", default)]
        province_state: Option<String>,
        #[serde(rename = "Country/Region")]
        country_region: String,
        #[serde(rename = "Lat", default)]
        latitude: Option<f64>,
        #[serde(rename = "Long", default)]
        longitude: Option<f64>,
        #[serde(rename = "Date")]
        date: NaiveDate,
        #[serde(rename = "Confirmed", default)]
        confirmed: i64,
        #[serde(rename = "Deaths", default)]
        deaths: i64,
        #[serde(rename = "Recovered", default)]
        recovered: i64,
        #[serde(rename = "WHO Region", default)]
        who_region: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        upsert_case(
            pool,
            row.province_state.as_deref().unwrap_or(""),
            &row.country_region,
            row.latitude,
            row.longitude,
            row.date,
            row.confirmed,
            row.deaths,
            row.recovered,
            row.who_region.as_deref().unwrap_or(""),
        )
        .await?;
        inserted += 1;
        if inserted % 10_000 == 0 {
            info!("ingested {inserted} rows");
        }
    }

    rebuild_daily_aggregates(pool).await?;
    Ok(inserted)
}

/// Rebuild `dashboard_metrics` wholesale from `daily_cases`: per-date sums,
/// day-over-day differences, and global rates with zero-safe denominators.
/// The table is never patched in place.
pub async fn rebuild_daily_aggregates(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM dashboard_metrics")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO dashboard_metrics
        (date, total_confirmed, total_deaths, total_recovered, total_active,
         daily_new_cases, daily_new_deaths, global_mortality_rate, global_recovery_rate)
        SELECT
            date,
            total_confirmed,
            total_deaths,
            total_recovered,
            total_active,
            COALESCE(total_confirmed - LAG(total_confirmed) OVER (ORDER BY date), 0),
            COALESCE(total_deaths - LAG(total_deaths) OVER (ORDER BY date), 0),
            CASE WHEN total_confirmed > 0
                 THEN CAST(total_deaths AS REAL) / total_confirmed * 100.0
                 ELSE 0.0 END,
            CASE WHEN total_confirmed > 0
                 THEN CAST(total_recovered AS REAL) / total_confirmed * 100.0
                 ELSE 0.0 END
        FROM (
            SELECT date,
                   SUM(confirmed) AS total_confirmed,
                   SUM(deaths) AS total_deaths,
                   SUM(recovered) AS total_recovered,
                   SUM(active) AS total_active
            FROM daily_cases
            GROUP BY date
        )
        ORDER BY date
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Deterministic three-country corpus with enough history to train on.
pub async fn seed(pool: &SqlitePool) -> anyhow::Result<()> {
    let start = NaiveDate::from_ymd_opt(2020, 3, 2).context("invalid date")?;
    let profiles: [(&str, &str, f64, f64, f64); 3] = [
        ("Norridge", "Europe", 60.47, 8.47, 0.02),
        ("Coastalia", "Americas", -14.23, -51.92, 0.05),
        ("Meridian", "Western Pacific", -25.27, 133.77, 0.09),
    ];

    for (country, region, lat, long, fatality) in profiles {
        for day in 0..40i64 {
            let confirmed = 400 + day * 55 + (day * day) / 2;
            let deaths = (confirmed as f64 * fatality) as i64;
            let recovered = confirmed / 3 + 2 * day;
            upsert_case(
                pool,
                "",
                country,
                Some(lat),
                Some(long),
                start + chrono::Duration::days(day),
                confirmed,
                deaths,
                recovered,
                region,
            )
            .await?;
        }
    }

    rebuild_daily_aggregates(pool).await?;
    Ok(())
}

/// One country's series summed over provinces, optionally date-bounded.
/// An empty result means the key was not found; that is an outcome, not an
/// error.
pub async fn fetch_country_series(
    pool: &SqlitePool,
    country: &str,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> anyhow::Result<Vec<CaseDay>> {
    let mut query = String::from(
        "SELECT date, country_region, SUM(confirmed) AS confirmed, \
         SUM(deaths) AS deaths, SUM(recovered) AS recovered, \
         SUM(active) AS active, MAX(who_region) AS who_region \
         FROM daily_cases WHERE country_region = $1",
    );
    if start_date.is_some() {
        query.push_str(" AND date >= $2");
    }
    if end_date.is_some() {
        query.push_str(if start_date.is_some() {
            " AND date <= $3"
        } else {
            " AND date <= $2"
        });
    }
    query.push_str(" GROUP BY date, country_region ORDER BY date ASC");

    let mut rows = sqlx::query(&query).bind(country);
    if let Some(value) = start_date {
        rows = rows.bind(value);
    }
    if let Some(value) = end_date {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await?;
    Ok(records.iter().map(case_day_from_row).collect())
}

fn case_day_from_row(row: &sqlx::sqlite::SqliteRow) -> CaseDay {
    CaseDay {
        country: row.get("country_region"),
        date: row.get("date"),
        confirmed: row.get("confirmed"),
        deaths: row.get("deaths"),
        recovered: row.get("recovered"),
        active: row.get("active"),
        who_region: row.get("who_region"),
    }
}

pub async fn latest_date(pool: &SqlitePool) -> anyhow::Result<Option<NaiveDate>> {
    let row = sqlx::query("SELECT MAX(date) AS max_date FROM daily_cases")
        .fetch_one(pool)
        .await?;
    Ok(row.get("max_date"))
}

/// Per-WHO-region sums for one date; rows with a blank region are excluded.
pub async fn fetch_region_rollup(
    pool: &SqlitePool,
    date: NaiveDate,
) -> anyhow::Result<Vec<RegionRollup>> {
    let records = sqlx::query(
        r#"
        SELECT who_region,
               SUM(confirmed) AS confirmed,
               SUM(deaths) AS deaths,
               SUM(recovered) AS recovered,
               SUM(active) AS active
        FROM daily_cases
        WHERE date = $1 AND who_region != ''
        GROUP BY who_region
        ORDER BY confirmed DESC
        "#,
    )
    .bind(date)
    .fetch_all(pool)
    .await?;

    Ok(records
        .iter()
        .map(|row| RegionRollup {
            region: row.get("who_region"),
            confirmed: row.get("confirmed"),
            deaths: row.get("deaths"),
            recovered: row.get("recovered"),
            active: row.get("active"),
        })
        .collect())
}

const RANKING_METRICS: [&str; 4] = ["confirmed", "deaths", "recovered", "active"];

/// Top-N countries on one date ranked by a whitelisted metric, with the
/// per-row mortality rate computed on the way out.
pub async fn fetch_top_countries(
    pool: &SqlitePool,
    date: NaiveDate,
    metric: &str,
    limit: i64,
) -> anyhow::Result<Vec<CountryRanking>> {
    anyhow::ensure!(
        RANKING_METRICS.contains(&metric),
        "unknown metric '{metric}', expected one of: {}",
        RANKING_METRICS.join(", ")
    );

    // The metric is interpolated only after whitelist validation.
    let query = format!(
        "SELECT country_region, SUM(confirmed) AS confirmed, \
         SUM(deaths) AS deaths, SUM(recovered) AS recovered, \
         SUM(active) AS active \
         FROM daily_cases WHERE date = $1 \
         GROUP BY country_region ORDER BY SUM({metric}) DESC LIMIT $2"
    );

    let records = sqlx::query(&query)
        .bind(date)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    Ok(records
        .iter()
        .map(|row| {
            let confirmed: i64 = row.get("confirmed");
            let deaths: i64 = row.get("deaths");
            CountryRanking {
                country: row.get("country_region"),
                confirmed,
                deaths,
                recovered: row.get("recovered"),
                active: row.get("active"),
                mortality_rate: mortality_rate(deaths as f64, confirmed as f64),
            }
        })
        .collect())
}

/// The precomputed global aggregate for one date, or the latest when no
/// date is given.
pub async fn fetch_daily_aggregate(
    pool: &SqlitePool,
    date: Option<NaiveDate>,
) -> anyhow::Result<Option<DailyAggregate>> {
    let record = match date {
        Some(date) => {
            sqlx::query("SELECT * FROM dashboard_metrics WHERE date = $1")
                .bind(date)
                .fetch_optional(pool)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM dashboard_metrics ORDER BY date DESC LIMIT 1")
                .fetch_optional(pool)
                .await?
        }
    };
    Ok(record.as_ref().map(aggregate_from_row))
}

pub async fn fetch_aggregate_series(
    pool: &SqlitePool,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> anyhow::Result<Vec<DailyAggregate>> {
    let mut query = String::from("SELECT * FROM dashboard_metrics WHERE 1=1");
    if start_date.is_some() {
        query.push_str(" AND date >= $1");
    }
    if end_date.is_some() {
        query.push_str(if start_date.is_some() {
            " AND date <= $2"
        } else {
            " AND date <= $1"
        });
    }
    query.push_str(" ORDER BY date ASC");

    let mut rows = sqlx::query(&query);
    if let Some(value) = start_date {
        rows = rows.bind(value);
    }
    if let Some(value) = end_date {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await?;
    Ok(records.iter().map(aggregate_from_row).collect())
}

fn aggregate_from_row(row: &sqlx::sqlite::SqliteRow) -> DailyAggregate {
    DailyAggregate {
        date: row.get("date"),
        total_confirmed: row.get("total_confirmed"),
        total_deaths: row.get("total_deaths"),
        total_recovered: row.get("total_recovered"),
        total_active: row.get("total_active"),
        daily_new_cases: row.get("daily_new_cases"),
        daily_new_deaths: row.get("daily_new_deaths"),
        global_mortality_rate: row.get("global_mortality_rate"),
        global_recovery_rate: row.get("global_recovery_rate"),
    }
}

/// Per-country series for the training job: summed over provinces, filtered
/// to established outbreaks, ordered by (country, date).
pub async fn fetch_training_series(pool: &SqlitePool) -> anyhow::Result<Vec<CaseDay>> {
    let records = sqlx::query(
        r#"
        SELECT country_region, date,
               SUM(confirmed) AS confirmed,
               SUM(deaths) AS deaths,
               SUM(recovered) AS recovered,
               SUM(active) AS active,
               MAX(who_region) AS who_region
        FROM daily_cases
        GROUP BY country_region, date
        HAVING SUM(confirmed) > 100 AND SUM(deaths) >= 0
        ORDER BY country_region, date
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(records.iter().map(case_day_from_row).collect())
}

/// The row backing one FHIR Observation, or None when there is no data for
/// the (country, date) key.
pub async fn fetch_observation_row(
    pool: &SqlitePool,
    country: &str,
    date: NaiveDate,
) -> anyhow::Result<Option<ObservationRow>> {
    let record = sqlx::query(
        r#"
        SELECT country_region, date,
               SUM(confirmed) AS confirmed,
               SUM(deaths) AS deaths,
               SUM(recovered) AS recovered,
               MIN(latitude) AS latitude,
               MIN(longitude) AS longitude
        FROM daily_cases
        WHERE country_region = $1 AND date = $2
        GROUP BY country_region, date
        "#,
    )
    .bind(country)
    .bind(date)
    .fetch_optional(pool)
    .await?;

    Ok(record.map(|row| ObservationRow {
        country: row.get("country_region"),
        date: row.get("date"),
        confirmed: row.get("confirmed"),
        deaths: row.get("deaths"),
        recovered: row.get("recovered"),
        latitude: row.get("latitude"),
        longitude: row.get("longitude"),
    }))
}
