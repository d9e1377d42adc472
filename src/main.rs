use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use covid_risk_watch::access::AccessGate;
use covid_risk_watch::features::Snapshot;
use covid_risk_watch::forest::ForestConfig;
use covid_risk_watch::predict::MortalityPredictor;
use covid_risk_watch::{artifact, db, fhir, train};

#[derive(Parser)]
#[command(name = "covid-risk-watch")]
#[command(about = "COVID-19 case store, aggregates, and mortality-risk decision support", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    InitDb,
    /// Load a deterministic synthetic case corpus
    Seed,
    /// Import daily case rows from a CSV file and rebuild aggregates
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Per-date case series for one country
    Country {
        name: String,
        #[arg(long)]
        start_date: Option<NaiveDate>,
        #[arg(long)]
        end_date: Option<NaiveDate>,
    },
    /// Latest-date rollup by WHO region
    Regions,
    /// Latest-date top countries by a metric
    Top {
        #[arg(long, default_value = "confirmed")]
        metric: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Global aggregate for one date (latest when omitted)
    Metrics {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Global aggregate series for charting
    Timeseries {
        #[arg(long)]
        start_date: Option<NaiveDate>,
        #[arg(long)]
        end_date: Option<NaiveDate>,
    },
    /// FHIR Observation for one (country, date)
    Observation {
        #[arg(long)]
        country: String,
        #[arg(long)]
        date: NaiveDate,
    },
    /// FHIR CapabilityStatement
    Capability,
    /// Train the mortality-risk model and persist the artifact
    Train {
        #[arg(long, default_value = "models")]
        models_dir: PathBuf,
    },
    /// Score one case snapshot (requires the use_cdss permission)
    Predict {
        /// JSON snapshot, e.g. '{"confirmed":1000,"deaths":50}'
        #[arg(long)]
        input: String,
        #[arg(long)]
        api_key: String,
        #[arg(long, default_value = "models")]
        models_dir: PathBuf,
    },
    /// Show persisted model metrics (requires the view_ml_model permission)
    ModelMetrics {
        #[arg(long)]
        api_key: String,
        #[arg(long, default_value = "models")]
        models_dir: PathBuf,
    },
}

async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to the case store")
}

/// Resolve the presented key and check the action against its role. The
/// gate is an explicit value handed in by the caller, never global state.
fn authorize(gate: &AccessGate, api_key: &str, action: &str) -> anyhow::Result<String> {
    let role = gate
        .resolve(api_key)
        .context("authentication required: unknown API key")?;
    anyhow::ensure!(
        gate.is_allowed(&role.name, action),
        "access denied for role '{}': permission required: {action}",
        role.name
    );
    Ok(role.name)
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://covid.db?mode=rwc".to_string());
    let gate = AccessGate::demo();

    match cli.command {
        Commands::InitDb => {
            let pool = connect(&database_url).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect(&database_url).await?;
            db::init_db(&pool).await?;
            db::seed(&pool).await?;
            println!("Seed data inserted and aggregates rebuilt.");
        }
        Commands::Import { csv } => {
            let pool = connect(&database_url).await?;
            db::init_db(&pool).await?;
            let inserted = db::import_csv(&pool, &csv).await?;
            println!(
                "Ingested {inserted} case rows from {} and rebuilt aggregates.",
                csv.display()
            );
        }
        Commands::Country {
            name,
            start_date,
            end_date,
        } => {
            let pool = connect(&database_url).await?;
            let series = db::fetch_country_series(&pool, &name, start_date, end_date).await?;
            if series.is_empty() {
                println!("No data found for country: {name}");
                return Ok(());
            }
            print_json(&json!({
                "status": "success",
                "country": name,
                "count": series.len(),
                "data": series,
            }))?;
        }
        Commands::Regions => {
            let pool = connect(&database_url).await?;
            let Some(latest) = db::latest_date(&pool).await? else {
                println!("The case store is empty.");
                return Ok(());
            };
            let rollup = db::fetch_region_rollup(&pool, latest).await?;
            print_json(&json!({
                "status": "success",
                "date": latest.to_string(),
                "count": rollup.len(),
                "data": rollup,
            }))?;
        }
        Commands::Top { metric, limit } => {
            let pool = connect(&database_url).await?;
            let Some(latest) = db::latest_date(&pool).await? else {
                println!("The case store is empty.");
                return Ok(());
            };
            let rankings = db::fetch_top_countries(&pool, latest, &metric, limit).await?;
            print_json(&json!({
                "status": "success",
                "date": latest.to_string(),
                "metric": metric,
                "count": rankings.len(),
                "data": rankings,
            }))?;
        }
        Commands::Metrics { date } => {
            let pool = connect(&database_url).await?;
            match db::fetch_daily_aggregate(&pool, date).await? {
                Some(aggregate) => print_json(&json!({
                    "status": "success",
                    "data": aggregate,
                }))?,
                None => println!("No aggregate data found for the requested date."),
            }
        }
        Commands::Timeseries {
            start_date,
            end_date,
        } => {
            let pool = connect(&database_url).await?;
            let series = db::fetch_aggregate_series(&pool, start_date, end_date).await?;
            if series.is_empty() {
                println!("No aggregate data found for this window.");
                return Ok(());
            }
            print_json(&json!({
                "status": "success",
                "count": series.len(),
                "data": series,
            }))?;
        }
        Commands::Observation { country, date } => {
            let pool = connect(&database_url).await?;
            match db::fetch_observation_row(&pool, &country, date).await? {
                Some(row) => print_json(&fhir::observation(&row))?,
                None => print_json(&fhir::operation_outcome(
                    "not-found",
                    &format!("No data found for {country} on {date}"),
                ))?,
            }
        }
        Commands::Capability => {
            print_json(&fhir::capability_statement())?;
        }
        Commands::Train { models_dir } => {
            let pool = connect(&database_url).await?;
            let series = db::fetch_training_series(&pool).await?;
            let trained = train::train(&series, ForestConfig::default())?;
            artifact::save(&models_dir, &trained)?;

            let m = &trained.metrics;
            println!("Training complete.");
            println!(
                "  mortality threshold (60th percentile): {:.2}%",
                m.mortality_threshold
            );
            println!(
                "  samples: {} train / {} test",
                m.training_samples, m.test_samples
            );
            println!("  CV AUC: {:.4} (+/- {:.4})", m.cv_mean, m.cv_std * 2.0);
            println!(
                "  test: accuracy {:.4}, precision {:.4}, recall {:.4}, F1 {:.4}, AUC {:.4}",
                m.accuracy, m.precision, m.recall, m.f1_score, m.auc_roc
            );
            println!(
                "  overfitting gap: {:.4} (train accuracy {:.4})",
                m.overfitting_gap, m.train_accuracy
            );
            println!("Artifact written to {}.", models_dir.display());
        }
        Commands::Predict {
            input,
            api_key,
            models_dir,
        } => {
            authorize(&gate, &api_key, "use_cdss")?;
            let snapshot: Snapshot =
                serde_json::from_str(&input).context("invalid snapshot JSON")?;
            let predictor = MortalityPredictor::load(&models_dir)?;
            let assessment = predictor.predict(&snapshot)?;

            let confirmed = snapshot.confirmed.unwrap_or(0.0);
            let deaths = snapshot.deaths.unwrap_or(0.0);
            let recovered = snapshot.recovered.unwrap_or(0.0);
            print_json(&json!({
                "status": "success",
                "prediction": assessment,
                "input_data": {
                    "confirmed": confirmed,
                    "deaths": deaths,
                    "recovered": recovered,
                    "active": snapshot.active.unwrap_or(confirmed - deaths - recovered),
                },
                "model_info": {
                    "type": "bagged decision-tree ensemble",
                    "features_count": predictor.feature_columns().len(),
                    "training_accuracy": predictor.metrics().accuracy,
                },
            }))?;
        }
        Commands::ModelMetrics {
            api_key,
            models_dir,
        } => {
            authorize(&gate, &api_key, "view_ml_model")?;
            let predictor = MortalityPredictor::load(&models_dir)?;
            let m = predictor.metrics();

            // Serve at most ~100 ROC points; the full curve can be large.
            let step = (m.roc_curve.fpr.len() / 100).max(1);
            let fpr: Vec<f64> = m.roc_curve.fpr.iter().copied().step_by(step).collect();
            let tpr: Vec<f64> = m.roc_curve.tpr.iter().copied().step_by(step).collect();

            print_json(&json!({
                "status": "success",
                "metrics": {
                    "accuracy": m.accuracy,
                    "precision": m.precision,
                    "recall": m.recall,
                    "f1_score": m.f1_score,
                    "auc_roc": m.auc_roc,
                },
                "roc_curve": { "fpr": fpr, "tpr": tpr, "auc": m.auc_roc },
                "confusion_matrix": {
                    "true_negative": m.confusion_matrix[0][0],
                    "false_positive": m.confusion_matrix[0][1],
                    "false_negative": m.confusion_matrix[1][0],
                    "true_positive": m.confusion_matrix[1][1],
                },
                "feature_importance": m.feature_importance.iter().take(10).collect::<Vec<_>>(),
                "training_info": {
                    "training_samples": m.training_samples,
                    "test_samples": m.test_samples,
                    "mortality_threshold": m.mortality_threshold,
                },
            }))?;
        }
    }

    Ok(())
}
