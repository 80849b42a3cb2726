//! Prediction web service.
//!
//! ```text
//! POST /predict   {"PULocationID": 9, "DOLocationID": 70, "trip_distance": 20}
//!              -> {"ride": {...}, "duration": 17.3}
//! ```
//!
//! `ride` is the request body exactly as received, extra fields included.
//!
//! The booster handle cannot be shared between threads, so the loaded
//! pipeline lives on one dedicated thread. Handlers send it feature
//! dictionaries over a channel and await the answer on a oneshot.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::features::{ride_features, FeatureDict, Ride};
use crate::registry::ModelRegistry;
use crate::trainer::Pipeline;

struct Job {
    features: FeatureDict,
    reply: oneshot::Sender<Result<f64>>,
}

/// Owns the thread that holds the loaded pipeline.
pub struct PredictionWorker {
    tx: mpsc::Sender<Job>,
}

impl PredictionWorker {
    /// Load the pipeline saved in `dir` on a fresh thread. Returns once the
    /// load has finished, with the load error if there was one.
    pub fn spawn(dir: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let dir = dir.to_path_buf();

        thread::Builder::new()
            .name("predictor".into())
            .spawn(move || {
                let pipeline = match Pipeline::load(&dir) {
                    Ok(p) => {
                        let _ = ready_tx.send(Ok(()));
                        p
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                info!(path = %dir.display(), "pipeline loaded");

                while let Ok(job) = rx.recv() {
                    let _ = job.reply.send(pipeline.predict_one(&job.features));
                }
                debug!("prediction worker stopped");
            })?;

        ready_rx
            .recv()
            .map_err(|_| PipelineError::Server("prediction worker exited during startup".into()))??;
        Ok(Self { tx })
    }

    pub async fn predict(&self, features: FeatureDict) -> Result<f64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job { features, reply })
            .map_err(|_| PipelineError::Server("prediction worker is gone".into()))?;
        rx.await
            .map_err(|_| PipelineError::Server("prediction worker dropped the request".into()))?
    }
}

/// Response body of `POST /predict`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub ride: Value,
    pub duration: f64,
}

#[derive(Clone)]
struct AppState {
    worker: Arc<PredictionWorker>,
}

pub fn router(worker: PredictionWorker) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .with_state(AppState {
            worker: Arc::new(worker),
        })
}

fn json_error(status: StatusCode, e: &PipelineError) -> Response {
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

async fn predict(State(state): State<AppState>, Json(ride): Json<Value>) -> Response {
    let features = match ride_features(&ride) {
        Ok(f) => f,
        Err(e) => {
            debug!(%ride, "rejected ride: {e}");
            return json_error(StatusCode::BAD_REQUEST, &e);
        }
    };

    match state.worker.predict(features).await {
        Ok(duration) => {
            debug!(%ride, duration, "prediction served");
            Json(Prediction { ride, duration }).into_response()
        }
        Err(e) => {
            error!(%ride, "prediction failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

/// The pipeline directory to serve: the configured one when it holds a saved
/// pipeline, otherwise the registry's production version fetched into
/// `{models_root}/{version}`.
pub fn resolve_pipeline_dir(cfg: &Config) -> Result<PathBuf> {
    if Pipeline::exists(&cfg.server.pipeline) {
        return Ok(cfg.server.pipeline.clone());
    }

    let registry = ModelRegistry::from_config(&cfg.registry);
    let version = registry.production_version()?.ok_or_else(|| {
        PipelineError::Server(format!(
            "no pipeline at {} and no production version of {}",
            cfg.server.pipeline.display(),
            cfg.registry.model_id
        ))
    })?;

    let dest = cfg.paths.models_root.join(&version.id);
    if !Pipeline::exists(&dest) {
        registry.download(&version.id, &dest)?;
    }
    info!(version = %version.id, path = %dest.display(), "serving registry model");
    Ok(dest)
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_on<F>(listener: TcpListener, worker: PredictionWorker, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "prediction service listening");

    axum::serve(listener, router(worker))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| PipelineError::Server(format!("server error: {e}")))?;

    info!("prediction service shut down");
    Ok(())
}

pub async fn serve(worker: PredictionWorker, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| PipelineError::Server(format!("bind failed on {addr}: {e}")))?;
    serve_on(listener, worker, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Resolve the model, load it and serve until Ctrl-C.
pub fn run(cfg: &Config) -> Result<()> {
    let dir = resolve_pipeline_dir(cfg)?;
    let worker = PredictionWorker::spawn(&dir)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(worker, &cfg.server.bind_addr()))
}

/// POST `ride` to a running service.
pub fn request_prediction(url: &str, ride: &Ride) -> Result<Prediction> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let prediction = client
        .post(url)
        .json(ride)
        .send()?
        .error_for_status()?
        .json()?;
    Ok(prediction)
}
