//! Vectorizer + gradient-boosted regressor, trained on feature dictionaries.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use xgboost::{parameters, Booster, DMatrix};

use crate::config::ModelParams;
use crate::error::{PipelineError, Result};
use crate::features::{DictVectorizer, FeatureDict, SparseMatrix};

const VECTORIZER_FILE: &str = "vectorizer.json";
const BOOSTER_FILE: &str = "booster.model";

/// Directory name of the saved pipeline under the models root.
pub const PIPELINE_DIR: &str = "pipeline";

fn to_dmatrix(matrix: &SparseMatrix) -> Result<DMatrix> {
    Ok(DMatrix::from_csr(
        &matrix.indptr,
        &matrix.indices,
        &matrix.data,
        Some(matrix.n_cols),
    )?)
}

fn model_error(e: String) -> PipelineError {
    PipelineError::Model(e)
}

/// A fitted vectorizer and booster, saved together as one directory.
pub struct Pipeline {
    vectorizer: DictVectorizer,
    booster: Booster,
}

impl Pipeline {
    pub fn fit(features: &[FeatureDict], targets: &[f64], params: &ModelParams) -> Result<Self> {
        if features.is_empty() {
            return Err(PipelineError::EmptyDataset("no training records".into()));
        }
        if features.len() != targets.len() {
            return Err(PipelineError::Model(format!(
                "{} feature records but {} targets",
                features.len(),
                targets.len()
            )));
        }

        let vectorizer = DictVectorizer::fit(features);
        let mut dtrain = to_dmatrix(&vectorizer.transform(features))?;
        let labels: Vec<f32> = targets.iter().map(|y| *y as f32).collect();
        dtrain.set_labels(&labels)?;

        let learning_params = parameters::learning::LearningTaskParametersBuilder::default()
            .objective(parameters::learning::Objective::RegLinear)
            .build()
            .map_err(model_error)?;

        let tree_params = parameters::tree::TreeBoosterParametersBuilder::default()
            .max_depth(params.max_depth)
            .eta(params.eta)
            .build()
            .map_err(model_error)?;

        let booster_params = parameters::BoosterParametersBuilder::default()
            .booster_type(parameters::BoosterType::Tree(tree_params))
            .learning_params(learning_params)
            .verbose(false)
            .build()
            .map_err(model_error)?;

        let training_params = parameters::TrainingParametersBuilder::default()
            .dtrain(&dtrain)
            .boost_rounds(params.n_estimators)
            .booster_params(booster_params)
            .build()
            .map_err(model_error)?;

        debug!(rows = features.len(), cols = vectorizer.len(), "fitting booster");
        let booster = Booster::train(&training_params)?;

        Ok(Self {
            vectorizer,
            booster,
        })
    }

    pub fn vectorizer(&self) -> &DictVectorizer {
        &self.vectorizer
    }

    pub fn predict(&self, features: &[FeatureDict]) -> Result<Vec<f64>> {
        if features.is_empty() {
            return Ok(Vec::new());
        }
        let dmat = to_dmatrix(&self.vectorizer.transform(features))?;
        let preds = self.booster.predict(&dmat)?;
        Ok(preds.into_iter().map(f64::from).collect())
    }

    pub fn predict_one(&self, features: &FeatureDict) -> Result<f64> {
        self.predict(std::slice::from_ref(features))?
            .first()
            .copied()
            .ok_or_else(|| PipelineError::Model("booster returned no prediction".into()))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let writer = BufWriter::new(File::create(dir.join(VECTORIZER_FILE))?);
        serde_json::to_writer(writer, &self.vectorizer)?;
        self.booster.save(dir.join(BOOSTER_FILE))?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let vectorizer_path = dir.join(VECTORIZER_FILE);
        let booster_path = dir.join(BOOSTER_FILE);
        if !vectorizer_path.exists() || !booster_path.exists() {
            return Err(PipelineError::NotFitted);
        }
        let reader = BufReader::new(File::open(vectorizer_path)?);
        let vectorizer = serde_json::from_reader(reader)?;
        let booster = Booster::load(booster_path)?;
        Ok(Self {
            vectorizer,
            booster,
        })
    }

    /// Whether `dir` holds a saved pipeline.
    pub fn exists(dir: &Path) -> bool {
        dir.join(VECTORIZER_FILE).exists() && dir.join(BOOSTER_FILE).exists()
    }
}

/// Root mean squared error.
pub fn rmse(y_true: &[f64], y_pred: &[f64]) -> Result<f64> {
    if y_true.len() != y_pred.len() {
        return Err(PipelineError::Model(format!(
            "{} targets but {} predictions",
            y_true.len(),
            y_pred.len()
        )));
    }
    if y_true.is_empty() {
        return Err(PipelineError::EmptyDataset("nothing to score".into()));
    }
    let sse: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    Ok((sse / y_true.len() as f64).sqrt())
}

/// Labeled feature dictionaries.
#[derive(Debug, Clone, Default)]
pub struct Split {
    pub features: Vec<FeatureDict>,
    pub targets: Vec<f64>,
}

impl Split {
    pub fn new(features: Vec<FeatureDict>, targets: Vec<f64>) -> Self {
        Self { features, targets }
    }
}

pub struct Trainer {
    pub params: ModelParams,
    train: Split,
    test: Split,
    pipeline: Option<Pipeline>,
    pipeline_path: PathBuf,
}

impl Trainer {
    pub fn new(params: ModelParams, models_root: &Path) -> Self {
        Self {
            params,
            train: Split::default(),
            test: Split::default(),
            pipeline: None,
            pipeline_path: models_root.join(PIPELINE_DIR),
        }
    }

    pub fn with_train(mut self, split: Split) -> Self {
        self.train = split;
        self
    }

    pub fn with_test(mut self, split: Split) -> Self {
        self.test = split;
        self
    }

    pub fn pipeline_path(&self) -> &Path {
        &self.pipeline_path
    }

    pub fn pipeline(&self) -> Option<&Pipeline> {
        self.pipeline.as_ref()
    }

    pub fn train(&mut self) -> Result<()> {
        info!(
            rows = self.train.features.len(),
            n_estimators = self.params.n_estimators,
            max_depth = self.params.max_depth,
            "training pipeline"
        );
        let pipeline = Pipeline::fit(&self.train.features, &self.train.targets, &self.params)?;
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn fitted(&mut self) -> Result<&Pipeline> {
        if self.pipeline.is_none() {
            self.load_pipeline()?;
        }
        self.pipeline.as_ref().ok_or(PipelineError::NotFitted)
    }

    /// RMSE on the test split, loading the saved pipeline if none is in memory.
    pub fn evaluate(&mut self) -> Result<f64> {
        let test = std::mem::take(&mut self.test);
        let scored = self
            .fitted()
            .and_then(|p| p.predict(&test.features))
            .and_then(|preds| rmse(&test.targets, &preds));
        self.test = test;

        let rmse = scored?;
        info!(rows = self.test.features.len(), rmse, "evaluated pipeline");
        Ok(rmse)
    }

    pub fn predict(&mut self, features: &FeatureDict) -> Result<f64> {
        self.fitted()?.predict_one(features)
    }

    pub fn save_pipeline(&self) -> Result<()> {
        let pipeline = self.pipeline.as_ref().ok_or(PipelineError::NotFitted)?;
        pipeline.save(&self.pipeline_path)?;
        info!(path = %self.pipeline_path.display(), "pipeline saved");
        Ok(())
    }

    pub fn load_pipeline(&mut self) -> Result<()> {
        self.pipeline = Some(Pipeline::load(&self.pipeline_path)?);
        Ok(())
    }
}
