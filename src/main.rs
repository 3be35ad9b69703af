use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

mod config;
mod countries;
mod dashboard;
mod error;
mod graphs;
mod models;
mod parse;
mod report;
mod repository;
mod stats;

use config::{DashboardConfig, ExperimentSettings};
use repository::CsvRepository;
use stats::StatsBuilder;

#[derive(Parser)]
#[command(name = "admissions-experiment")]
#[command(about = "Applicant demographics and experiment planning dashboard", long_about = None)]
struct Cli {
    /// CSV file holding the applicant records
    #[arg(
        long,
        global = true,
        env = "ADMISSIONS_CSV",
        default_value = "mydata/admissions_dataset.csv"
    )]
    data: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the interactive dashboard
    Serve {
        #[arg(long, env = "DASHBOARD_ADDR", default_value = "127.0.0.1:8050")]
        addr: SocketAddr,
        /// Seed used by the experiment button
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Observations needed to detect an effect size
    SampleSize {
        #[arg(long)]
        effect_size: f64,
    },
    /// Chance of collecting the required observations within a duration
    Reach {
        #[arg(long)]
        effect_size: f64,
        #[arg(long)]
        days: u32,
    },
    /// Replay historical days as a simulated experiment (rewrites the data file)
    Simulate {
        #[arg(long)]
        days: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Chi-square test of experimental group against quiz completion
    ChiSquare,
    /// Generate a markdown report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder().with_env_filter(env).init();

    let cli = Cli::parse();
    let settings = ExperimentSettings::default();
    let stats = StatsBuilder::new(settings);

    match cli.command {
        Commands::Serve { addr, seed } => {
            let repo = load_repository(&cli.data)?;
            let config = DashboardConfig {
                data_path: cli.data.clone(),
                addr,
                seed,
                settings,
            };
            let state = dashboard::AppState::new(repo, &config);
            dashboard::serve(state, &config).await;
        }
        Commands::SampleSize { effect_size } => {
            let n_obs = stats.required_sample_size(effect_size)?;
            println!(
                "To detect an effect size of {effect_size}, you would need {n_obs} observations."
            );
        }
        Commands::Reach { effect_size, days } => {
            let repo = load_repository(&cli.data)?;
            let n_obs = stats.required_sample_size(effect_size)?;
            let pct = stats.reach_probability(&repo, n_obs, days)?;
            println!(
                "The probability of getting {n_obs} observations in {days} days is {pct:.1}%."
            );
        }
        Commands::Simulate { days, seed } => {
            let mut repo = load_repository(&cli.data)?;
            let result = stats.simulate_experiment(&mut repo, days, seed)?;
            println!(
                "Simulated {} applicants over {} days; {} now holds {} rows.",
                result.total_users,
                result.days_sampled,
                repo.path().display(),
                repo.len()
            );
            for day in &result.daily_sample {
                println!("- {}: {} applicants", day.date, day.users);
            }
        }
        Commands::ChiSquare => {
            let repo = load_repository(&cli.data)?;
            let table = repo.contingency_table();
            for group in &table.groups {
                let cells: Vec<String> = table
                    .outcomes
                    .iter()
                    .map(|outcome| format!("{} {}", outcome.label(), table.get(group, *outcome)))
                    .collect();
                println!("- {group}: {}", cells.join(", "));
            }
            let result = stats.association_test(&repo)?;
            println!(
                "chi-square over {} applicants: statistic {:.4}, df {}, p-value {:.4}",
                table.total(),
                result.statistic,
                result.df,
                result.pvalue
            );
        }
        Commands::Report { out } => {
            let repo = load_repository(&cli.data)?;
            let report = report::build_report(&repo, &stats, Utc::now().date_naive());
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            info!("report written to {}", out.display());
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

fn load_repository(path: &Path) -> anyhow::Result<CsvRepository> {
    CsvRepository::load(path)
        .with_context(|| format!("failed to load applicants from {}", path.display()))
}
