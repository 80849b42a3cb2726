//! End-to-end drivers: train, evaluate, training job, deploy.
//!
//! Training on month M scores against month M-1:
//!
//! ```text
//! download -> prepare -> features   (M,   train)  \
//!                                                   -> train -> evaluate -> save
//! download -> prepare -> features   (M-1, test)   /
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::{Config, ModelParams};
use crate::dataset::Dataset;
use crate::error::{PipelineError, Result};
use crate::features::Ride;
use crate::registry::{ModelRegistry, ModelVersion, Stage};
use crate::storage::{self, ObjectStore, Uploader};
use crate::trainer::{Pipeline, Trainer};
use crate::window::{Mode, TripWindow};

/// Registry metadata written next to the staged pipeline.
pub const MANIFEST_FILE: &str = "version.json";

/// Ride used to smoke-test a freshly deployed model.
pub const SAMPLE_RIDE: Ride = Ride {
    pickup_zone: 9,
    dropoff_zone: 70,
    trip_distance: 20.0,
};

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub train_window: TripWindow,
    pub test_window: TripWindow,
    pub params: ModelParams,
    pub rmse: f64,
    pub pipeline_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub training: TrainOutcome,
    pub version: ModelVersion,
    pub report: String,
}

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub version: ModelVersion,
    pub model_dir: PathBuf,
    pub sample: Ride,
    pub prediction: f64,
    /// Staged files that reached the bucket.
    pub uploaded: usize,
    pub report: String,
}

fn dataset(cfg: &Config, window: TripWindow, mode: Mode) -> Dataset {
    Dataset::new(
        window,
        mode,
        &cfg.source.base_url,
        &cfg.paths.data_root,
        cfg.transform.clone(),
    )
}

fn open_store(cfg: &Config) -> Result<Option<Box<dyn ObjectStore>>> {
    storage::from_config(&cfg.storage)
}

/// The window configured under `[source]`.
pub fn configured_window(cfg: &Config) -> Result<TripWindow> {
    TripWindow::new(&cfg.source.taxi_type, cfg.source.year, cfg.source.month)
}

/// Train on `window`, score on the month before it, save the pipeline.
pub fn train(cfg: &Config, window: &TripWindow) -> Result<TrainOutcome> {
    let store = open_store(cfg)?;
    let uploader = store
        .as_deref()
        .map(|s| Uploader::new(s, &cfg.storage.prefix));

    let test_window = window.previous()?;
    info!(train = %window, test = %test_window, "starting training run");

    let mut train_data = dataset(cfg, window.clone(), Mode::Train);
    let mut test_data = dataset(cfg, test_window.clone(), Mode::Test);
    train_data.run(uploader.as_ref())?;
    test_data.run(uploader.as_ref())?;

    let mut trainer = Trainer::new(cfg.model.clone(), &cfg.paths.models_root)
        .with_train(train_data.into_split()?)
        .with_test(test_data.into_split()?);
    trainer.train()?;
    let rmse = trainer.evaluate()?;
    info!(params = ?trainer.params, rmse, "training finished");
    trainer.save_pipeline()?;

    Ok(TrainOutcome {
        train_window: window.clone(),
        test_window,
        params: trainer.params.clone(),
        rmse,
        pipeline_path: trainer.pipeline_path().to_path_buf(),
    })
}

/// Score the saved pipeline against `window`.
pub fn evaluate(cfg: &Config, window: &TripWindow) -> Result<f64> {
    let store = open_store(cfg)?;
    let uploader = store
        .as_deref()
        .map(|s| Uploader::new(s, &cfg.storage.prefix));

    let mut test_data = dataset(cfg, window.clone(), Mode::Test);
    test_data.run(uploader.as_ref())?;

    let mut trainer =
        Trainer::new(cfg.model.clone(), &cfg.paths.models_root).with_test(test_data.into_split()?);
    let rmse = trainer.evaluate()?;
    info!(window = %window, rmse, "evaluation finished");
    Ok(rmse)
}

pub fn training_report(outcome: &TrainOutcome, version: &ModelVersion) -> String {
    let p = &outcome.params;
    format!(
        "# Training Job Report\n\n\
         Trained on: {train}\n\
         Tested on: {test}\n\
         Registered version: {version} ({stage:?})\n\n\
         ## Training Job parameters\n\n\
         - n_estimators: {n}\n\
         - max_depth: {depth}\n\
         - eta: {eta}\n\n\
         ## RMSE\n\n\
         {rmse}\n",
        train = outcome.train_window,
        test = outcome.test_window,
        version = version.id,
        stage = version.stage,
        n = p.n_estimators,
        depth = p.max_depth,
        eta = p.eta,
        rmse = outcome.rmse,
    )
}

/// Register a finished training run and write its report.
pub fn publish(cfg: &Config, training: TrainOutcome, promote: bool) -> Result<JobOutcome> {
    let registry = ModelRegistry::from_config(&cfg.registry);
    let mut version = registry.register(&training.pipeline_path, &training.params, training.rmse)?;
    if promote {
        version = registry.set_stage(&version.id, Stage::Production)?;
    }

    let report = training_report(&training, &version);
    write_report(&cfg.paths.training_report, &report)?;
    info!(path = %cfg.paths.training_report.display(), "training report written");

    Ok(JobOutcome {
        training,
        version,
        report,
    })
}

/// Train on the configured window, register the result, write the report.
pub fn run_training_job(cfg: &Config, promote: bool) -> Result<JobOutcome> {
    let window = configured_window(cfg)?;
    let training = train(cfg, &window)?;
    publish(cfg, training, promote)
}

pub fn deploy_report(version: &ModelVersion, model_dir: &Path, sample: &Ride, prediction: f64) -> String {
    format!(
        "# Deployment Job Report\n\n\
         Model {version} staged at {dir}.\n\n\
         Registry RMSE: {rmse}\n\n\
         Smoke test ride: PULocationID={pu} DOLocationID={dof} trip_distance={dist}\n\n\
         Predicted duration: {prediction}\n",
        version = version.id,
        dir = model_dir.display(),
        rmse = version.rmse,
        pu = sample.pickup_zone,
        dof = sample.dropoff_zone,
        dist = sample.trip_distance,
    )
}

/// Stage the production model for serving, publish it, smoke-test it.
pub fn deploy(cfg: &Config) -> Result<DeployOutcome> {
    let registry = ModelRegistry::from_config(&cfg.registry);
    let version = registry.production_version()?.ok_or_else(|| {
        PipelineError::Registry(format!(
            "no production version of {} in project {}",
            cfg.registry.model_id, cfg.registry.project
        ))
    })?;
    info!(version = %version.id, "deploying production model");

    let model_dir = cfg.server.pipeline.clone();
    if model_dir.exists() {
        fs::remove_dir_all(&model_dir)?;
    }
    registry.download(&version.id, &model_dir)?;
    fs::write(
        model_dir.join(MANIFEST_FILE),
        serde_json::to_vec_pretty(&version)?,
    )?;

    let mut uploaded = 0;
    if let Some(store) = open_store(cfg)? {
        let subfolder = format!("deployments/{}", version.id);
        let uploader = Uploader::new(&*store, &cfg.storage.prefix);
        for entry in fs::read_dir(&model_dir)? {
            let path = entry?.path();
            if path.is_file() && uploader.upload(&path, &subfolder) {
                uploaded += 1;
            }
        }
        info!(version = %version.id, uploaded, "deployment artifacts published");
    }

    let pipeline = Pipeline::load(&model_dir)?;
    let sample = SAMPLE_RIDE;
    let prediction = pipeline.predict_one(&sample.features())?;
    info!(version = %version.id, prediction, "smoke test passed");

    let report = deploy_report(&version, &model_dir, &sample, prediction);
    write_report(&cfg.paths.deploy_report, &report)?;

    Ok(DeployOutcome {
        version,
        model_dir,
        sample,
        prediction,
        uploaded,
        report,
    })
}

fn write_report(path: &Path, report: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, report)?;
    Ok(())
}
