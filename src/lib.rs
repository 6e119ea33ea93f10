#![deny(missing_docs)]
//! # rankeval
//!
//! `rankeval` evaluates and tunes recommender models. Given a fitted
//! recommender and a held-out set of interactions it computes ranking
//! metrics (AUC, normalized MRR@k, normalized DCG@k, precision, recall and
//! catalog coverage) either exactly, by scoring the whole catalog, or
//! approximately, from each user's top-N recommendations. On top of the
//! evaluator sit an early-stopping controller and a hyperparameter search
//! loop.
//!
//! ## Example
//!
//! ```rust,no_run
//! # extern crate rankeval;
//! # extern crate rand;
//! # extern crate rand_xorshift;
//! # use rand::SeedableRng;
//! use rankeval::evaluation::{evaluate, EvaluationParams};
//! use rankeval::exclusion::ExclusionMask;
//! use rankeval::models::factorization::Hyperparameters;
//! use rankeval::Recommender;
//!
//! let data = rankeval::datasets::download_movielens_100k().unwrap();
//! let mut rng = rand_xorshift::XorShiftRng::from_seed([42; 16]);
//!
//! let (train, test) = data.split_train_test(&mut rng, 0.2, 1.0);
//!
//! let mut model = Hyperparameters::new()
//!     .latent_dim(32)
//!     .learning_rate(0.05)
//!     .num_epochs(20)
//!     .build();
//!
//! let loss = model.fit(&train).unwrap();
//!
//! let report = evaluate(
//!     &model,
//!     &[("test", &test)],
//!     &ExclusionMask::training(),
//!     &EvaluationParams::new(10).n_rec(200).include_train(true),
//! )
//! .unwrap();
//!
//! println!("Loss {}\n{}", loss, report);
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[cfg(feature = "default")]
extern crate csv;
#[macro_use]
extern crate failure;
extern crate ndarray;
extern crate rand;
extern crate rand_xorshift;
extern crate rayon;
extern crate serde;
extern crate serde_json;
extern crate siphasher;
#[macro_use]
extern crate tracing;

#[cfg(feature = "default")]
extern crate reqwest;

pub mod data;
pub mod datasets;
pub mod early_stop;
pub mod evaluation;
pub mod exclusion;
pub mod metrics;
pub mod models;
pub mod ranking;
pub mod search;

#[cfg(test)]
mod testing;

use data::{CompressedInteractions, Interactions};
use exclusion::ExclusionMask;
use models::ModelState;
use search::{ParamValue, Params, SearchSpace};

/// Alias for dense user indices.
pub type UserId = usize;
/// Alias for dense item indices.
pub type ItemId = usize;

/// Invalid parameter combinations. Always raised before any training
/// or scoring happens.
#[derive(Debug, Fail)]
pub enum ConfigurationError {
    /// The rank cutoff must be at least one.
    #[fail(display = "The rank cutoff k must be positive.")]
    NonPositiveK,
    /// Approximate evaluation must retrieve at least `k` items.
    #[fail(display = "n_rec ({}) must not be smaller than k ({}).", n_rec, k)]
    NRecBelowK {
        /// Requested number of recommendations.
        n_rec: usize,
        /// Rank cutoff.
        k: usize,
    },
    /// Early stopping cannot take a single step.
    #[fail(
        display = "epochs_max ({}) must not be smaller than epochs_step ({}).",
        epochs_max, epochs_step
    )]
    EpochsMaxBelowStep {
        /// Maximum number of epochs.
        epochs_max: usize,
        /// Epochs per early-stopping step.
        epochs_step: usize,
    },
    /// Early stopping must train at least one epoch per step.
    #[fail(display = "epochs_step must be positive.")]
    NonPositiveEpochsStep,
    /// Early stopping must tolerate at least one non-improving step.
    #[fail(display = "stop_patience must be positive.")]
    NonPositivePatience,
    /// Split ratios must lie strictly between 0 and 1.
    #[fail(display = "Ratio {} must lie strictly between 0 and 1.", _0)]
    InvalidRatio(f32),
    /// The hyperparameter search space has no dimensions.
    #[fail(display = "The hyperparameter search space is empty.")]
    EmptySearchSpace,
    /// The hyperparameter search must run at least one trial.
    #[fail(display = "The number of search iterations must be positive.")]
    NoIterations,
    /// A search dimension has inconsistent bounds.
    #[fail(display = "Invalid search dimension {}: {}", name, reason)]
    InvalidDimension {
        /// Dimension name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
    /// The model does not know a hyperparameter of this name.
    #[fail(display = "Unknown hyperparameter: {}", _0)]
    UnknownParameter(String),
    /// The model cannot accept this value for a hyperparameter.
    #[fail(display = "Invalid value {:?} for hyperparameter {}.", value, name)]
    InvalidParameterValue {
        /// Hyperparameter name.
        name: String,
        /// Rejected value.
        value: ParamValue,
    },
}

/// Model fitting error types.
#[derive(Debug, Fail)]
pub enum FittingError {
    /// No interactions were given.
    #[fail(display = "No interactions were supplied.")]
    NoInteractions,
    /// The model rejected a hyperparameter value at fit time.
    #[fail(display = "Invalid hyperparameter {}: {}", name, reason)]
    InvalidHyperparameter {
        /// Hyperparameter name.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// Training diverged.
    #[fail(display = "Training loss is not finite.")]
    NonFiniteLoss,
    /// Ensemble members were fitted on different user or item sets.
    #[fail(display = "Ensemble members do not share user and item indices.")]
    IncompatibleModels,
    /// An ensemble needs at least one member.
    #[fail(display = "An ensemble needs at least one member.")]
    EmptyEnsemble,
}

/// Prediction error types.
#[derive(Debug, Fail)]
pub enum PredictionError {
    /// The model must be fitted before it can predict.
    #[fail(display = "Model must be fitted first.")]
    NotFitted,
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
}

/// Errors surfaced by evaluation, early stopping and search.
#[derive(Debug, Fail)]
pub enum Error {
    /// Invalid parameters.
    #[fail(display = "{}", _0)]
    Configuration(#[fail(cause)] ConfigurationError),
    /// The underlying model failed to fit.
    #[fail(display = "{}", _0)]
    Fitting(#[fail(cause)] FittingError),
    /// The underlying model failed to predict.
    #[fail(display = "{}", _0)]
    Prediction(#[fail(cause)] PredictionError),
}

impl From<ConfigurationError> for Error {
    fn from(error: ConfigurationError) -> Self {
        Error::Configuration(error)
    }
}

impl From<FittingError> for Error {
    fn from(error: FittingError) -> Self {
        Error::Fitting(error)
    }
}

impl From<PredictionError> for Error {
    fn from(error: PredictionError) -> Self {
        Error::Prediction(error)
    }
}

/// A single scored (user, item) pair returned by `predict_for_user`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// External user id.
    pub user_id: String,
    /// External item id.
    pub item_id: String,
    /// Score; higher is better.
    pub prediction: f32,
}

/// Top-N recommendations for one user, best first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    /// External user id.
    pub user_id: String,
    /// Recommended item ids.
    pub item_ids: Vec<String>,
    /// Scores parallel to `item_ids`, non-increasing.
    pub predictions: Vec<f32>,
}

/// Most similar items for one source item, best first. Never contains the
/// source item itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimilarItems {
    /// External id of the source item.
    pub source_item_id: String,
    /// Similar item ids.
    pub item_ids: Vec<String>,
    /// Similarities parallel to `item_ids`, non-increasing.
    pub predictions: Vec<f32>,
}

/// Capabilities every recommender variant exposes.
///
/// Implementors provide fitting and raw scoring over dense indices; the
/// id-level serving API (`predict_for_user`, `get_recommendations`,
/// `get_similar_items`) is derived from those in [`ranking`].
///
/// Exclusions are passed explicitly as an [`ExclusionMask`] rather than
/// stored on the model, so the same fitted model can be evaluated under
/// different masks without being copied.
pub trait Recommender {
    /// Fit the model from scratch, returning the final training loss.
    fn fit(&mut self, train: &Interactions) -> Result<f32, FittingError>;
    /// The parameters the model was (or will be) fitted with, including
    /// `epochs` for iteratively trained models.
    fn fit_params(&self) -> Params;
    /// Indices and training matrix, present once the model is fitted.
    fn state(&self) -> Option<&ModelState>;
    /// Raw scores of `item_ids` for `user_id`, in the order given.
    fn predict(&self, user_id: UserId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError>;
    /// Raw similarities between `item_id` and each of `item_ids`.
    fn similarity(&self, item_id: ItemId, item_ids: &[ItemId])
        -> Result<Vec<f32>, PredictionError>;

    /// External ids of all known users, in index order.
    fn all_users(&self) -> &[String] {
        self.state().map(|state| state.users.ids()).unwrap_or(&[])
    }

    /// External ids of all known items, in index order.
    fn all_items(&self) -> &[String] {
        self.state().map(|state| state.items.ids()).unwrap_or(&[])
    }

    /// Translate external user ids to indices.
    fn user_inds(&self, user_ids: &[&str]) -> Vec<Option<UserId>> {
        user_ids
            .iter()
            .map(|id| self.state().and_then(|state| state.users.get(id)))
            .collect()
    }

    /// Translate item indices to external ids.
    fn item_ids(&self, item_inds: &[ItemId]) -> Vec<Option<&str>> {
        item_inds
            .iter()
            .map(|&idx| self.state().and_then(|state| state.items.id(idx)))
            .collect()
    }

    /// The sparse training interaction matrix.
    fn train_mat(&self) -> Option<&CompressedInteractions> {
        self.state().map(|state| &state.train_mat)
    }

    /// Score `item_ids` for `user_id`, best first.
    ///
    /// Excluded and unknown items score `f32::MIN`; an unknown user scores
    /// `f32::MIN` everywhere.
    fn predict_for_user(
        &self,
        exclusions: &ExclusionMask,
        user_id: &str,
        item_ids: &[&str],
        combine_original_order: bool,
    ) -> Result<Vec<Prediction>, PredictionError> {
        ranking::predict_for_user(self, exclusions, user_id, item_ids, combine_original_order)
    }

    /// Top `n_rec` non-excluded items for each of `user_ids` (all users if
    /// `None`).
    fn get_recommendations(
        &self,
        exclusions: &ExclusionMask,
        user_ids: Option<&[&str]>,
        n_rec: usize,
    ) -> Result<Vec<Recommendations>, PredictionError> {
        ranking::get_recommendations(self, exclusions, user_ids, n_rec)
    }

    /// The `n_simil` most similar items for each of `item_ids` (all items
    /// if `None`).
    fn get_similar_items(
        &self,
        item_ids: Option<&[&str]>,
        n_simil: usize,
    ) -> Result<Vec<SimilarItems>, PredictionError> {
        ranking::get_similar_items(self, item_ids, n_simil)
    }
}

/// Models whose training can be extended epoch by epoch.
pub trait EpochTrainable: Recommender {
    /// Train for `num_epochs` more epochs, continuing from the current
    /// weights. An unfitted model is initialised from `train` first.
    fn fit_epochs(&mut self, train: &Interactions, num_epochs: usize) -> Result<f32, FittingError>;
    /// Total epochs trained since the last initialisation.
    fn epochs(&self) -> usize;
}

/// Models that can be re-instantiated from named hyperparameters.
pub trait Tunable: Recommender + Sized {
    /// A fresh, unfitted model with the same hyperparameters.
    fn unfitted(&self) -> Self;
    /// Overwrite hyperparameters by name.
    fn set_params(&mut self, params: &Params) -> Result<(), ConfigurationError>;
    /// A reasonable default search space for this model.
    fn guess_search_space(&self) -> SearchSpace;
}
