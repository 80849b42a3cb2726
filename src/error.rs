//! Library-wide error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid window: {0}")]
    Window(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("pipeline has not been fitted or saved yet")]
    NotFitted,

    #[error("registry error: {0}")]
    Registry(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("dataframe error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    #[error("xgboost error: {0}")]
    XGBoost(#[from] xgboost::XGBError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
