//! Train -> register -> deploy against synthetic monthly files already
//! sitting in the raw cache, so no request leaves the machine.

mod common;

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;

use polars::prelude::*;
use tempfile::TempDir;

use taxi_duration_predictor::config::{Config, ModelParams, StorageBackend};
use taxi_duration_predictor::dataset::{write_parquet, DROPOFF_TIME, PICKUP_TIME};
use taxi_duration_predictor::features::{DROPOFF_ZONE, PICKUP_ZONE, TRIP_DISTANCE};
use taxi_duration_predictor::window::DataPaths;
use taxi_duration_predictor::{jobs, ModelRegistry, Mode, Pipeline, Stage, TripWindow};

const MICROS: i64 = 1_000_000;

/// `rows` trips whose duration (in 20s units) tracks distance, plus two
/// trips outside the kept range.
fn month_frame(rows: usize) -> DataFrame {
    let zones = [(7i64, 129i64), (74, 75), (41, 42), (9, 70)];
    let mut pickup = Vec::new();
    let mut dropoff = Vec::new();
    let mut pu = Vec::new();
    let mut dof = Vec::new();
    let mut distance = Vec::new();

    for i in 0..rows {
        let (p, d) = zones[i % zones.len()];
        let dist = 0.5 + (i % 9) as f64;
        let units = 4.0 + 5.0 * dist + (i % zones.len()) as f64;
        pickup.push(0i64);
        dropoff.push((units * 20.0) as i64 * MICROS);
        pu.push(p);
        dof.push(d);
        distance.push(dist);
    }
    for secs in [5i64, 5000] {
        pickup.push(0);
        dropoff.push(secs * MICROS);
        pu.push(1);
        dof.push(2);
        distance.push(1.0);
    }

    let ts = |name: &str, v: Vec<i64>| {
        Series::new(name, v)
            .cast(&DataType::Datetime(TimeUnit::Microseconds, None))
            .unwrap()
    };
    DataFrame::new(vec![
        ts(PICKUP_TIME, pickup),
        ts(DROPOFF_TIME, dropoff),
        Series::new(PICKUP_ZONE, pu),
        Series::new(DROPOFF_ZONE, dof),
        Series::new(TRIP_DISTANCE, distance),
    ])
    .unwrap()
}

fn seed_raw(cfg: &Config, window: &TripWindow, mode: Mode, rows: usize) {
    let paths = DataPaths::resolve(window, mode, &cfg.source.base_url, &cfg.paths.data_root);
    fs::create_dir_all(paths.raw.parent().unwrap()).unwrap();
    write_parquet(&mut month_frame(rows), &paths.raw).unwrap();
}

fn config(root: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.source.base_url = "http://unused.invalid/".into();
    cfg.source.year = 2022;
    cfg.source.month = 1;
    cfg.model = ModelParams {
        n_estimators: 20,
        max_depth: 4,
        eta: 0.3,
    };
    cfg.paths.data_root = root.join("data");
    cfg.paths.models_root = root.join("models");
    cfg.paths.training_report = root.join("latest_performance.md");
    cfg.paths.deploy_report = root.join("deploy-report.md");
    cfg.registry.root = root.join("registry");
    cfg.server.pipeline = root.join("serving").join("model");
    cfg.storage.enabled = true;
    cfg.storage.backend = StorageBackend::Local;
    cfg.storage.local_root = root.join("buckets");
    cfg
}

fn seeded(tmp: &TempDir) -> Config {
    let cfg = config(tmp.path());
    let train = jobs::configured_window(&cfg).unwrap();
    let test = train.previous().unwrap();
    assert_eq!((test.year, test.month), (2021, 12));
    seed_raw(&cfg, &train, Mode::Train, 240);
    seed_raw(&cfg, &test, Mode::Test, 80);
    cfg
}

#[test]
fn training_job_registers_and_reports() {
    let tmp = TempDir::new().unwrap();
    let cfg = seeded(&tmp);

    let outcome = jobs::run_training_job(&cfg, false).unwrap();
    assert!(outcome.training.rmse.is_finite());
    assert_eq!(outcome.version.id, "MLOPS-RF1-1");
    assert_eq!(outcome.version.stage, Stage::Unassigned);
    assert!(Pipeline::exists(&outcome.training.pipeline_path));

    let report = fs::read_to_string(&cfg.paths.training_report).unwrap();
    assert!(report.contains("n_estimators: 20"));
    assert!(report.contains("green 2021-12"));

    let processed = tmp.path().join("data/processed/train_green_2022-1.json");
    assert!(processed.exists());
    let uploaded = tmp
        .path()
        .join("buckets/taxi-duration/web-service/processed/train_green_2022-1.json");
    assert!(uploaded.exists());
}

#[test]
fn evaluate_scores_saved_pipeline() {
    let tmp = TempDir::new().unwrap();
    let cfg = seeded(&tmp);

    let trained = jobs::train(&cfg, &jobs::configured_window(&cfg).unwrap()).unwrap();
    let rmse = jobs::evaluate(&cfg, &trained.test_window).unwrap();
    assert!((rmse - trained.rmse).abs() < 1e-6);
}

#[test]
fn promoted_model_deploys_and_answers_sample_ride() {
    let tmp = TempDir::new().unwrap();
    let cfg = seeded(&tmp);

    let first = jobs::run_training_job(&cfg, true).unwrap();
    let second = jobs::run_training_job(&cfg, true).unwrap();
    assert_eq!(second.version.id, "MLOPS-RF1-2");

    let registry = ModelRegistry::from_config(&cfg.registry);
    assert_eq!(registry.get(&first.version.id).unwrap().stage, Stage::Archived);

    let deployed = jobs::deploy(&cfg).unwrap();
    assert_eq!(deployed.version.id, second.version.id);
    assert!(deployed.prediction.is_finite());
    assert!(Pipeline::exists(&cfg.server.pipeline));
    assert!(cfg.server.pipeline.join(jobs::MANIFEST_FILE).exists());
    assert_eq!(deployed.uploaded, 3);

    let report = fs::read_to_string(&cfg.paths.deploy_report).unwrap();
    assert!(report.contains("MLOPS-RF1-2"));
    assert!(report.contains("PULocationID=9"));

    let published = tmp
        .path()
        .join("buckets/taxi-duration/web-service/deployments/MLOPS-RF1-2/booster.model");
    assert!(published.exists());
}

#[test]
fn refused_uploads_do_not_stop_training_or_deploy() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = seeded(&tmp);
    let (endpoint, requests) = common::refusing_s3();
    cfg.storage.backend = StorageBackend::S3;
    cfg.storage.endpoint = Some(endpoint);
    cfg.storage.access_key_id = Some("AKIDEXAMPLE".into());
    cfg.storage.secret_access_key = Some("secret".into());

    let job = jobs::run_training_job(&cfg, true).unwrap();
    assert!(job.training.rmse.is_finite());

    let deployed = jobs::deploy(&cfg).unwrap();
    assert_eq!(deployed.uploaded, 0);
    assert!(deployed.prediction.is_finite());
    assert!(cfg.paths.deploy_report.exists());
    assert!(requests.load(Ordering::SeqCst) > 0);
}
