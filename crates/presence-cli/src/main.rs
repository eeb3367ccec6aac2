use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{Args, Parser, Subcommand, ValueEnum};
use presence_core::{
    AttendanceRecorder, Descriptor, DescriptorStore, FeatureExtractor, MatchResult,
    SimulatedExtractor,
};
use presence_store::SqliteStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod input;

use config::Config;
use engine::{spawn_engine, EngineHandle, MatchSettings};

#[derive(Parser)]
#[command(name = "presence", version, about = "Face-based attendance tracking")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/presence/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Database file, overriding the configured one
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face for an employee
    Enroll {
        /// Employee code (e.g., "EMP001")
        #[arg(short, long)]
        employee: String,
        /// Display name
        #[arg(short, long)]
        name: Option<String>,
        #[command(flatten)]
        probe: ProbeArgs,
    },
    /// Recognize faces and record attendance for each match
    CheckIn {
        /// Image files, one check-in per image
        #[arg(required_unless_present = "descriptor")]
        images: Vec<PathBuf>,
        /// JSON file holding a descriptor vector
        #[arg(long, conflicts_with = "images")]
        descriptor: Option<PathBuf>,
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Location tag for the attendance event
        #[arg(short, long)]
        location: Option<String>,
    },
    /// Recognize a face without recording attendance
    Recognize {
        #[command(flatten)]
        probe: ProbeArgs,
        #[arg(short, long)]
        threshold: Option<f32>,
        #[arg(long)]
        json: bool,
    },
    /// List enrolled faces, newest first
    List {
        #[arg(long)]
        json: bool,
    },
    /// List attendance events, newest first
    Records {
        #[arg(long)]
        json: bool,
    },
    /// Import data in the legacy JSON layout
    Import {
        #[arg(value_enum)]
        kind: DataKind,
        path: PathBuf,
    },
    /// Export data in the legacy JSON layout
    Export {
        #[arg(value_enum)]
        kind: DataKind,
        path: PathBuf,
    },
    /// Show database and matching status
    Status,
}

#[derive(Args)]
struct ProbeArgs {
    /// Image file to extract a descriptor from
    #[arg(required_unless_present = "descriptor")]
    image: Option<PathBuf>,
    /// JSON file holding a descriptor vector
    #[arg(long, conflicts_with = "image")]
    descriptor: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum DataKind {
    Enrollments,
    Attendance,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    config.validate().context("invalid configuration")?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );
    let extractor: Arc<dyn FeatureExtractor> =
        Arc::new(SimulatedExtractor::new(config.descriptor_len));

    match cli.command {
        Commands::Enroll {
            employee,
            name,
            probe,
        } => {
            let engine = start_engine(&store, &config)?;
            let descriptor = probe.resolve(extractor.as_ref(), config.descriptor_len)?;
            let outcome = engine.enroll(employee, name, descriptor).await?;

            if let Some(MatchResult::Matched {
                employee_id,
                similarity,
                ..
            }) = &outcome.possible_duplicate
            {
                println!(
                    "warning: face closely matches employee {employee_id} (similarity {similarity:.3})"
                );
            }
            println!(
                "Enrolled {}{}",
                outcome.record.employee_id,
                outcome
                    .record
                    .name
                    .as_deref()
                    .map(|n| format!(" ({n})"))
                    .unwrap_or_default()
            );
            Ok(())
        }
        Commands::CheckIn {
            images,
            descriptor,
            threshold,
            location,
        } => {
            let engine = start_engine(&store, &config)?;
            let location = location.unwrap_or_else(|| config.location.clone());

            if let Some(path) = descriptor {
                let probe = input::descriptor_from_json(&path, config.descriptor_len)?;
                let check_in = engine.check_in(probe, threshold, &location).await?;
                report_check_in(&path, &check_in);
            } else {
                check_in_images(&engine, &extractor, images, threshold, &location).await?;
            }
            Ok(())
        }
        Commands::Recognize {
            probe,
            threshold,
            json,
        } => {
            let engine = start_engine(&store, &config)?;
            let descriptor = probe.resolve(extractor.as_ref(), config.descriptor_len)?;
            let scan = engine.recognize(descriptor, threshold).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&scan.result)?);
            } else {
                match &scan.result {
                    MatchResult::Matched {
                        employee_id,
                        name,
                        similarity,
                    } => println!(
                        "Recognized {employee_id}{} (similarity {similarity:.3})",
                        name.as_deref().map(|n| format!(" ({n})")).unwrap_or_default()
                    ),
                    MatchResult::NoMatch => println!("Not recognized"),
                }
            }
            if scan.skipped > 0 {
                eprintln!(
                    "warning: {} enrollment(s) skipped due to descriptor length mismatch",
                    scan.skipped
                );
            }
            Ok(())
        }
        Commands::List { json } => {
            let mut records = store.all()?.as_ref().clone();
            records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No employees enrolled");
            } else {
                for record in &records {
                    println!(
                        "{:<12} {:<24} enrolled {}",
                        record.employee_id,
                        record.name.as_deref().unwrap_or("-"),
                        format_millis(record.timestamp)
                    );
                }
            }
            Ok(())
        }
        Commands::Records { json } => {
            let mut events = store.events()?;
            events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else if events.is_empty() {
                println!("No attendance records");
            } else {
                for event in &events {
                    println!(
                        "{}  {:<12} {:<24} {}",
                        format_millis(event.timestamp),
                        event.employee_id,
                        event.name,
                        event.location
                    );
                }
            }
            Ok(())
        }
        Commands::Import { kind, path } => {
            let summary = match kind {
                DataKind::Enrollments => presence_store::import_enrollments(store.as_ref(), &path)?,
                DataKind::Attendance => presence_store::import_attendance(store.as_ref(), &path)?,
            };
            println!(
                "Imported {} record(s), skipped {} invalid",
                summary.imported, summary.skipped
            );
            Ok(())
        }
        Commands::Export { kind, path } => {
            let count = match kind {
                DataKind::Enrollments => presence_store::export_enrollments(store.as_ref(), &path)?,
                DataKind::Attendance => presence_store::export_attendance(store.as_ref(), &path)?,
            };
            println!("Exported {count} record(s) to {}", path.display());
            Ok(())
        }
        Commands::Status => {
            let stats = store.stats()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "database": store.path().display().to_string(),
                    "enrollments": stats.enrollments,
                    "employees": stats.employees,
                    "attendance_events": stats.attendance_events,
                    "threshold": config.threshold,
                    "descriptor_len": config.descriptor_len,
                    "location": config.location,
                    "extractor": "simulated",
                }))?
            );
            Ok(())
        }
    }
}

impl ProbeArgs {
    fn resolve(&self, extractor: &dyn FeatureExtractor, descriptor_len: usize) -> Result<Descriptor> {
        match (&self.image, &self.descriptor) {
            (_, Some(path)) => input::descriptor_from_json(path, descriptor_len),
            (Some(path), None) => input::descriptor_from_image(extractor, path),
            (None, None) => bail!("an image or --descriptor is required"),
        }
    }
}

fn start_engine(store: &Arc<SqliteStore>, config: &Config) -> Result<EngineHandle> {
    let settings = MatchSettings {
        threshold: config.threshold,
        duplicate_threshold: config.duplicate_threshold,
        descriptor_len: config.descriptor_len,
        scan_timeout: config.scan_timeout(),
    };
    Ok(spawn_engine(store.clone(), store.clone(), settings)?)
}

/// Run one check-in per image concurrently; print results in argument order.
async fn check_in_images(
    engine: &EngineHandle,
    extractor: &Arc<dyn FeatureExtractor>,
    images: Vec<PathBuf>,
    threshold: Option<f32>,
    location: &str,
) -> Result<()> {
    let mut tasks = tokio::task::JoinSet::new();
    for (index, path) in images.into_iter().enumerate() {
        let engine = engine.clone();
        let extractor = Arc::clone(extractor);
        let location = location.to_string();
        tasks.spawn(async move {
            let result = async {
                let probe = tokio::task::spawn_blocking({
                    let path = path.clone();
                    move || input::descriptor_from_image(extractor.as_ref(), &path)
                })
                .await??;
                Ok::<_, anyhow::Error>(engine.check_in(probe, threshold, &location).await?)
            }
            .await;
            (index, path, result)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        results.push(joined?);
    }
    results.sort_by_key(|(index, _, _)| *index);

    let mut failures = 0;
    for (_, path, result) in results {
        match result {
            Ok(check_in) => report_check_in(&path, &check_in),
            Err(e) => {
                eprintln!("{}: error: {e:#}", path.display());
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} check-in(s) failed");
    }
    Ok(())
}

fn report_check_in(source: &Path, check_in: &engine::CheckIn) {
    match (&check_in.event, check_in.scan.result.similarity()) {
        (Some(event), Some(similarity)) => println!(
            "{}: attendance recorded for {} ({}) at {} (similarity {similarity:.3})",
            source.display(),
            event.employee_id,
            event.name,
            event.location
        ),
        _ => println!("{}: not recognized", source.display()),
    }
}

fn format_millis(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|utc| utc.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}
