use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

mod attendance;
mod config;
mod db;
mod error;
#[cfg(test)]
mod memory;
mod models;
mod progression;
mod promotion;
mod report;
mod store;

use attendance::Synchronizer;
use config::AppConfig;
use db::PgStore;
use models::CounterFailure;
use store::{AttendanceStore, RosterStore};

#[derive(Parser)]
#[command(name = "academy-progression")]
#[command(about = "Belt progression and attendance tracking for martial-arts academies", long_about = None)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,
    /// Academy whose roster the command operates on
    #[arg(long, env = "ACADEMY_TENANT_ID", global = true)]
    tenant: Option<Uuid>,
    #[arg(long, env = "ACADEMY_DB_MAX_CONNECTIONS", global = true, default_value_t = 5)]
    max_connections: u32,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    #[command(flatten)]
    Academy(AcademyCommand),
}

/// Commands that act on one academy's data.
#[derive(Subcommand)]
enum AcademyCommand {
    /// Load the default belt ladder plus a sample roster and schedule
    Seed,
    /// Import students from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Add a weekly class to the schedule
    AddClass {
        #[arg(long)]
        title: String,
        /// 0 = Sunday .. 6 = Saturday
        #[arg(long)]
        weekday: i16,
        #[arg(long)]
        start_time: String,
    },
    /// List the roster with progression status
    Roster,
    /// Record the full present-set for one class session
    Reconcile {
        #[arg(long)]
        class: Uuid,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long, value_delimiter = ',', num_args = 0..)]
        present: Vec<Uuid>,
    },
    /// Delete a class along with its attendance
    DeleteClass {
        #[arg(long)]
        class: Uuid,
    },
    /// Show one student's progression toward the next stripe and belt
    Progress {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        json: bool,
    },
    /// List students eligible for promotion
    Eligible,
    /// Award the next stripe
    PromoteStripe {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Move a student to the next belt
    PromoteBelt {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show a student's promotion history
    History {
        #[arg(long)]
        student: Uuid,
    },
    /// Rebuild a student's counters from the attendance log
    Recompute {
        #[arg(long)]
        student: Uuid,
    },
    /// Generate a markdown progression report
    Report {
        #[arg(long)]
        academy: Option<String>,
        #[arg(long, default_value_t = 30)]
        inactive_days: i64,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn print_failures(failures: &[CounterFailure]) {
    if failures.is_empty() {
        return;
    }
    println!(
        "Attendance was saved, but {} student counter update(s) failed. Run `recompute` for:",
        failures.len()
    );
    for failure in failures {
        println!("- {}: {}", failure.student_id, failure.reason);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::new(cli.database_url, cli.tenant, cli.max_connections)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    info!(max_connections = config.max_connections, "connected to Postgres");

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Academy(command) => {
            let tenant_id = config.tenant()?;
            db::ensure_default_belts(&pool, tenant_id)
                .await
                .context("failed to prepare the belt ladder")?;
            run(command, &pool, tenant_id).await?;
        }
    }

    Ok(())
}

async fn run(command: AcademyCommand, pool: &PgPool, tenant_id: Uuid) -> anyhow::Result<()> {
    let store = Arc::new(PgStore::new(pool.clone()));
    let today = Utc::now().date_naive();

    match command {
        AcademyCommand::Seed => {
            db::seed(pool, tenant_id).await?;
            println!("Seed data inserted.");
        }
        AcademyCommand::Import { csv } => {
            let inserted = db::import_roster_csv(pool, tenant_id, &csv)
                .await
                .with_context(|| format!("failed to import {}", csv.display()))?;
            println!("Inserted {inserted} students from {}.", csv.display());
        }
        AcademyCommand::AddClass {
            title,
            weekday,
            start_time,
        } => {
            let class = db::add_class(pool, tenant_id, &title, weekday, &start_time).await?;
            println!("Class {} created with id {}.", class.title, class.id);
        }
        AcademyCommand::Roster => {
            let ladder = store.get_belt_definitions(tenant_id).await?;
            let roster = store.list_students(tenant_id).await?;

            if roster.is_empty() {
                println!("No students on the roster.");
                return Ok(());
            }

            for student in roster.iter() {
                let belt = progression::resolve_belt(&ladder, student.belt_id);
                let summary = progression::student_summary(&ladder, student);
                println!(
                    "- {} [{}] {} ({} stripes) {}/{} classes ({:.0}%)",
                    student.name,
                    student.id,
                    belt.name,
                    student.stripes,
                    summary.current_progress,
                    summary.display_goal,
                    summary.progress_percent
                );
            }
        }
        AcademyCommand::Reconcile {
            class,
            date,
            present,
        } => {
            let sync = Synchronizer::new(store.clone());
            let outcome = match sync.reconcile(tenant_id, class, date, &present).await {
                Ok(outcome) => outcome,
                Err(error::Error::PartialLogWrite { source, removed, failures }) => {
                    println!(
                        "Removed {} student(s) from {date}, but adding the rest failed.",
                        removed.len()
                    );
                    print_failures(&failures);
                    return Err(anyhow::Error::new(*source).context("attendance insert failed"));
                }
                Err(err) => return Err(err.into()),
            };
            println!(
                "Attendance for {date}: {} added, {} removed, {} unchanged.",
                outcome.added.len(),
                outcome.removed.len(),
                outcome.unchanged
            );
            if !outcome.is_clean() {
                print_failures(&outcome.failures);
            }
        }
        AcademyCommand::DeleteClass { class } => {
            let sync = Synchronizer::new(store.clone());
            let outcome = sync.delete_class(tenant_id, class).await?;
            println!(
                "Class deleted: {} attendance rows removed across {} students.",
                outcome.logs_deleted, outcome.students_adjusted
            );
            print_failures(&outcome.failures);
        }
        AcademyCommand::Progress { student, json } => {
            let ladder = store.get_belt_definitions(tenant_id).await?;
            let record = store.get_student(tenant_id, student).await?;
            let summary = progression::student_summary(&ladder, &record);

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let belt = progression::resolve_belt(&ladder, record.belt_id);
                println!("{} ({}, {} stripes)", record.name, belt.name, record.stripes);
                println!(
                    "- progress {}/{} ({:.0}%)",
                    summary.current_progress, summary.display_goal, summary.progress_percent
                );
                if summary.ready_for_belt {
                    println!("- {} classes until the next belt", summary.remaining_for_stripe);
                } else {
                    println!("- {} classes until the next stripe", summary.remaining_for_stripe);
                }
                println!(
                    "- {}/{} classes toward this belt, {} remaining",
                    summary.virtual_total_classes, summary.classes_req_total, summary.remaining_for_graduation
                );
            }
        }
        AcademyCommand::Eligible => {
            let ladder = store.get_belt_definitions(tenant_id).await?;
            let roster = store.list_students(tenant_id).await?;
            let eligible = progression::eligible_students(&ladder, &roster);

            if eligible.is_empty() {
                println!("No students are eligible for promotion.");
                return Ok(());
            }

            println!("Eligible for promotion:");
            for student in eligible {
                let belt = progression::resolve_belt(&ladder, student.belt_id);
                let step = if student.stripes >= progression::MAX_STRIPES {
                    "belt"
                } else {
                    "stripe"
                };
                println!(
                    "- {} [{}] {} ({} stripes) ready for {}",
                    student.name, student.id, belt.name, student.stripes, step
                );
            }
        }
        AcademyCommand::PromoteStripe { student, date } => {
            let result = promotion::promote_stripe(store.as_ref(), tenant_id, student, date.unwrap_or(today)).await?;
            if !result.was_eligible {
                warn!("promotion recorded before the class requirement was met");
            }
            println!("{} promoted: {}.", result.student.name, result.record.item);
        }
        AcademyCommand::PromoteBelt { student, date } => {
            let result = promotion::promote_belt(store.as_ref(), tenant_id, student, date.unwrap_or(today)).await?;
            if !result.was_eligible {
                warn!("promotion recorded before the class requirement was met");
            }
            println!("{} promoted to {}.", result.student.name, result.record.item);
        }
        AcademyCommand::History { student } => {
            let history = store.student_history(tenant_id, student).await?;
            if history.is_empty() {
                println!("No promotions recorded.");
            }
            for record in history {
                println!("- {} [{}] {}", record.date, record.kind, record.item);
            }
        }
        AcademyCommand::Recompute { student } => {
            let sync = Synchronizer::new(store.clone());
            let counters = sync.recompute_counters(tenant_id, student).await?;
            let last = counters
                .last_attendance
                .map(|d| d.to_string())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "Counters rebuilt: {} classes since last promotion, last class {}.",
                counters.total_classes_attended, last
            );
        }
        AcademyCommand::Report {
            academy,
            inactive_days,
            out,
        } => {
            let (inactive_days, cutoff) = report::inactive_window(today, inactive_days);
            let ladder = store.get_belt_definitions(tenant_id).await?;
            let roster = store.list_students(tenant_id).await?;
            let report = report::build_report(academy.as_deref(), inactive_days, cutoff, &ladder, &roster);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
