use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use taxi_duration_predictor::{config, jobs, logger, server, Config, ModelRegistry, Ride, Stage};

/// Train, deploy and serve the taxi trip duration model.
#[derive(Parser)]
#[command(name = "taxi-duration-predictor", version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/pipeline.toml when present).
    #[arg(short, long, global = true, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

/// Overrides for the `[source]` window.
#[derive(Args)]
struct WindowArgs {
    /// Taxi type, e.g. green or yellow.
    #[arg(long)]
    taxi_type: Option<String>,

    #[arg(long)]
    year: Option<i32>,

    #[arg(long)]
    month: Option<u32>,
}

impl WindowArgs {
    fn apply(self, cfg: &mut Config) -> anyhow::Result<()> {
        if let Some(t) = self.taxi_type {
            cfg.source.taxi_type = t;
        }
        if let Some(y) = self.year {
            cfg.source.year = y;
        }
        if let Some(m) = self.month {
            cfg.source.month = m;
        }
        cfg.validate()?;
        Ok(())
    }
}

#[derive(Subcommand)]
enum Command {
    /// Train on a month, score on the month before, save the pipeline.
    Train {
        #[command(flatten)]
        window: WindowArgs,
    },

    /// Score the saved pipeline on a month.
    Evaluate {
        #[command(flatten)]
        window: WindowArgs,
    },

    /// Train, register the pipeline and write the training report.
    Job {
        #[command(flatten)]
        window: WindowArgs,

        /// Move the new version to the production stage.
        #[arg(long)]
        promote: bool,
    },

    /// Stage the production version for serving and smoke-test it.
    Deploy,

    /// Run the prediction web service.
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one ride to a running prediction service.
    Predict {
        #[arg(long, default_value = "http://localhost:9696/predict")]
        url: String,

        #[arg(long, default_value_t = 9)]
        pickup: i64,

        #[arg(long, default_value_t = 70)]
        dropoff: i64,

        #[arg(long, default_value_t = 20.0)]
        distance: f64,
    },

    /// Move a registered version to another stage.
    Promote {
        /// Version id, e.g. MLOPS-RF1-3.
        #[arg(value_name = "VERSION")]
        version_id: String,

        /// none, staging, production or archived.
        #[arg(long, default_value = "production")]
        stage: String,
    },

    /// List registered versions.
    Versions,
}

fn main() -> anyhow::Result<()> {
    // 1. Environment, CLI, config, logging
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref()).context("loading configuration")?;

    let verbosity = logger::level_for_verbosity(cli.verbose);
    let level = verbosity.map(str::to_string).unwrap_or_else(|| cfg.log_level.clone());
    logger::init(&level, verbosity.is_some())?;

    // 2. Dispatch
    match cli.command {
        Command::Train { window } => {
            window.apply(&mut cfg)?;
            let w = jobs::configured_window(&cfg)?;
            let outcome = jobs::train(&cfg, &w)?;
            println!("RMSE on {}: {:.4}", outcome.test_window, outcome.rmse);
        }
        Command::Evaluate { window } => {
            window.apply(&mut cfg)?;
            let w = jobs::configured_window(&cfg)?;
            let rmse = jobs::evaluate(&cfg, &w)?;
            println!("RMSE on {w}: {rmse:.4}");
        }
        Command::Job { window, promote } => {
            window.apply(&mut cfg)?;
            let outcome = jobs::run_training_job(&cfg, promote)?;
            info!(version = %outcome.version.id, "training job finished");
            print!("{}", outcome.report);
        }
        Command::Deploy => {
            let outcome = jobs::deploy(&cfg)?;
            print!("{}", outcome.report);
        }
        Command::Serve { port } => {
            if let Some(p) = port {
                cfg.server.port = p;
            }
            server::run(&cfg)?;
        }
        Command::Predict {
            url,
            pickup,
            dropoff,
            distance,
        } => {
            let ride = Ride {
                pickup_zone: pickup,
                dropoff_zone: dropoff,
                trip_distance: distance,
            };
            let prediction = server::request_prediction(&url, &ride)
                .with_context(|| format!("requesting prediction from {url}"))?;
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }
        Command::Promote { version_id, stage } => {
            let stage: Stage = stage.parse()?;
            let registry = ModelRegistry::from_config(&cfg.registry);
            let v = registry.set_stage(&version_id, stage)?;
            println!("{} -> {:?}", v.id, v.stage);
        }
        Command::Versions => {
            let registry = ModelRegistry::from_config(&cfg.registry);
            for v in registry.list_versions()? {
                println!("{}\t{:?}\trmse={:.4}\t{}", v.id, v.stage, v.rmse, v.created_at);
            }
        }
    }

    Ok(())
}
