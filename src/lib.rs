//! Taxi trip duration pipeline: download monthly trip records, derive
//! features, train a regressor, score it on the previous month, register
//! and deploy it, and serve predictions over HTTP.

pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod jobs;
pub mod logger;
pub mod registry;
pub mod server;
pub mod storage;
pub mod trainer;
pub mod window;

pub use config::Config;
pub use dataset::Dataset;
pub use error::{PipelineError, Result};
pub use features::{DictVectorizer, FeatureDict, FeatureValue, Ride};
pub use registry::{ModelRegistry, ModelVersion, Stage};
pub use trainer::{Pipeline, Split, Trainer};
pub use window::{Mode, TripWindow};
