//! Early stopping for iteratively trained models.
//!
//! The controller carves a validation split out of the training set, then
//! repeatedly trains `epochs_step` more epochs and evaluates every metric
//! on the validation split, appending a row to the trace. It stops after
//! `stop_patience` consecutive evaluations without improvement of the
//! target metric, or once `epochs_max` epochs have been trained. The
//! returned model is a snapshot taken at the best evaluation, or a fresh
//! model trained for the winning number of epochs on the full training set
//! if `refit_on_all` is set.
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;

use data::Interactions;
use evaluation::{evaluate, EvaluationParams, DEFAULT_N_REC};
use exclusion::ExclusionMask;
use metrics::Metric;
use {ConfigurationError, EpochTrainable, Error, Tunable};

/// Early stopping settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EarlyStopConfig {
    metric: Metric,
    k: usize,
    epochs_max: usize,
    epochs_step: usize,
    stop_patience: usize,
    valid_ratio: f32,
    refit_on_all: bool,
    n_rec: Option<usize>,
    seed: u64,
}

impl Default for EarlyStopConfig {
    fn default() -> Self {
        EarlyStopConfig {
            metric: Metric::NormalizedMrr,
            k: 10,
            epochs_max: 100,
            epochs_step: 10,
            stop_patience: 2,
            valid_ratio: 0.2,
            refit_on_all: false,
            n_rec: Some(DEFAULT_N_REC),
            seed: 42,
        }
    }
}

impl EarlyStopConfig {
    /// Default settings.
    pub fn new() -> Self {
        EarlyStopConfig::default()
    }

    /// Set the tracked metric.
    pub fn metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    /// Set the rank cutoff.
    pub fn k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Set the maximum total number of epochs.
    pub fn epochs_max(mut self, epochs_max: usize) -> Self {
        self.epochs_max = epochs_max;
        self
    }

    /// Set the number of epochs trained between evaluations.
    pub fn epochs_step(mut self, epochs_step: usize) -> Self {
        self.epochs_step = epochs_step;
        self
    }

    /// Set the number of consecutive non-improving evaluations to stop after.
    pub fn stop_patience(mut self, stop_patience: usize) -> Self {
        self.stop_patience = stop_patience;
        self
    }

    /// Set the fraction of each user's interactions held out for validation.
    pub fn valid_ratio(mut self, valid_ratio: f32) -> Self {
        self.valid_ratio = valid_ratio;
        self
    }

    /// Set whether to retrain on the full training set after convergence.
    pub fn refit_on_all(mut self, refit_on_all: bool) -> Self {
        self.refit_on_all = refit_on_all;
        self
    }

    /// Set the number of recommendations per user for approximate
    /// evaluation; `None` evaluates exactly.
    pub fn n_rec(mut self, n_rec: Option<usize>) -> Self {
        self.n_rec = n_rec;
        self
    }

    /// Set the random seed of the validation split.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check the settings.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.k == 0 {
            return Err(ConfigurationError::NonPositiveK);
        }
        if self.epochs_step == 0 {
            return Err(ConfigurationError::NonPositiveEpochsStep);
        }
        if self.epochs_max < self.epochs_step {
            return Err(ConfigurationError::EpochsMaxBelowStep {
                epochs_max: self.epochs_max,
                epochs_step: self.epochs_step,
            });
        }
        if self.stop_patience == 0 {
            return Err(ConfigurationError::NonPositivePatience);
        }
        if let Some(n_rec) = self.n_rec {
            if n_rec < self.k {
                return Err(ConfigurationError::NRecBelowK { n_rec, k: self.k });
            }
        }
        if !(self.valid_ratio > 0.0 && self.valid_ratio < 1.0) {
            return Err(ConfigurationError::InvalidRatio(self.valid_ratio));
        }

        Ok(())
    }
}

/// Controller state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum EarlyStopState {
    /// Training, with the last evaluation not improving on the best.
    Running {
        /// Epochs trained so far.
        epochs: usize,
    },
    /// The last evaluation was the best so far.
    Improved {
        /// Epochs trained so far.
        epochs: usize,
        /// Best metric value.
        best_metric: f32,
    },
    /// Stopped.
    Converged {
        /// Epochs at the best evaluation.
        best_epochs: usize,
    },
}

/// Evaluations so far, one row per step.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopTrace {
    /// Metric columns.
    pub columns: Vec<String>,
    /// Cumulative epochs of each row.
    pub epochs: Vec<usize>,
    /// Metric values of each row, in column order.
    pub values: Vec<Vec<f32>>,
}

impl EarlyStopTrace {
    /// Number of evaluations.
    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    /// Whether nothing has been evaluated.
    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Values of one metric, in row order.
    pub fn column(&self, metric: Metric) -> Vec<f32> {
        self.values.iter().map(|row| row[metric.column()]).collect()
    }

    /// Epoch count of the first row maximizing `metric`.
    pub fn argmax(&self, metric: Metric) -> Option<usize> {
        let column = self.column(metric);

        column
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (idx, &value)| match best {
                Some((_, best_value)) if best_value >= value => best,
                _ => Some((idx, value)),
            })
            .map(|(idx, _)| self.epochs[idx])
    }
}

/// Early-stop controller. Keeps the trace of its last run.
#[derive(Clone, Debug)]
pub struct EarlyStopper {
    config: EarlyStopConfig,
    state: EarlyStopState,
    trace: EarlyStopTrace,
}

impl EarlyStopper {
    /// Validate `config` and build a controller.
    pub fn new(config: EarlyStopConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;

        Ok(EarlyStopper {
            config,
            state: EarlyStopState::Running { epochs: 0 },
            trace: EarlyStopTrace::default(),
        })
    }

    /// Current state.
    pub fn state(&self) -> EarlyStopState {
        self.state
    }

    /// Trace of the last run.
    pub fn trace(&self) -> &EarlyStopTrace {
        &self.trace
    }

    /// Winning epoch count, once converged.
    pub fn best_epochs(&self) -> Option<usize> {
        match self.state {
            EarlyStopState::Converged { best_epochs } => Some(best_epochs),
            _ => None,
        }
    }

    /// Train a fresh copy of `template` with early stopping.
    pub fn fit<R>(&mut self, template: &R, train: &Interactions) -> Result<R, Error>
    where
        R: EpochTrainable + Tunable + Clone + Sync,
    {
        let config = self.config.clone();
        config.validate()?;

        let mut rng = XorShiftRng::seed_from_u64(config.seed);
        let (fit_set, valid_set) = train.split_train_test(&mut rng, config.valid_ratio, 1.0);

        let params = EvaluationParams {
            n_rec: config.n_rec,
            ..EvaluationParams::new(config.k)
        };
        let exclusions = ExclusionMask::training();

        self.state = EarlyStopState::Running { epochs: 0 };
        self.trace = EarlyStopTrace {
            columns: Metric::ALL.iter().map(|metric| metric.name(config.k)).collect(),
            ..EarlyStopTrace::default()
        };

        let mut model = template.unfitted();
        let mut best: Option<(R, usize, f32)> = None;
        let mut patience = 0;

        while model.epochs() < config.epochs_max {
            let step = config.epochs_step.min(config.epochs_max - model.epochs());
            model.fit_epochs(&fit_set, step)?;
            let epochs = model.epochs();

            let report = evaluate(&model, &[("valid", &valid_set)], &exclusions, &params)?;
            let values = report.rows[0].values.clone();
            let value = values[config.metric.column()];

            self.trace.epochs.push(epochs);
            self.trace.values.push(values);

            let improved = best.as_ref().map_or(true, |&(_, _, best_value)| value > best_value);

            if improved {
                info!("Epoch {}: {} improved to {:.4}", epochs, config.metric, value);
                patience = 0;
                self.state = EarlyStopState::Improved {
                    epochs,
                    best_metric: value,
                };
                best = Some((model.clone(), epochs, value));
            } else {
                patience += 1;
                info!(
                    "Epoch {}: {} at {:.4}, no improvement for {} step(s)",
                    epochs, config.metric, value, patience
                );
                self.state = EarlyStopState::Running { epochs };

                if patience >= config.stop_patience {
                    break;
                }
            }
        }

        let (best_model, best_epochs) = match best {
            Some((model, epochs, _)) => (model, epochs),
            None => {
                return Err(Error::Configuration(ConfigurationError::EpochsMaxBelowStep {
                    epochs_max: config.epochs_max,
                    epochs_step: config.epochs_step,
                }))
            }
        };

        self.state = EarlyStopState::Converged { best_epochs };
        info!("Converged at {} epochs", best_epochs);

        if config.refit_on_all {
            let mut refit = template.unfitted();
            refit.fit_epochs(train, best_epochs)?;
            return Ok(refit);
        }

        Ok(best_model)
    }
}

/// Replace `model` with an early-stopped copy trained on `train`, returning
/// the controller for inspection.
pub fn fit_with_early_stop<R>(model: &mut R, train: &Interactions, config: EarlyStopConfig) -> Result<EarlyStopper, Error>
where
    R: EpochTrainable + Tunable + Clone + Sync,
{
    let mut stopper = EarlyStopper::new(config)?;
    *model = stopper.fit(model, train)?;

    Ok(stopper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::cooccurrence::ItemCooccurrenceModel;
    use models::factorization::Hyperparameters;
    use models::ModelState;
    use search::{Params, SearchSpace};
    use testing;
    use {ConfigurationError, FittingError, ItemId, PredictionError, Recommender, UserId};

    /// Ranks well only after exactly `peak` epochs, and in reverse
    /// otherwise.
    #[derive(Clone)]
    struct Peaked {
        inner: ItemCooccurrenceModel,
        epochs: usize,
        peak: usize,
    }

    impl Recommender for Peaked {
        fn fit(&mut self, train: &Interactions) -> Result<f32, FittingError> {
            self.epochs = 0;
            self.inner.fit(train)
        }
        fn fit_params(&self) -> Params {
            let mut params = Params::new();
            params.insert("epochs".to_owned(), self.epochs.into());
            params
        }
        fn state(&self) -> Option<&ModelState> {
            self.inner.state()
        }
        fn predict(&self, user_id: UserId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
            let sign = if self.epochs == self.peak { 1.0 } else { -1.0 };
            Ok(self
                .inner
                .predict(user_id, item_ids)?
                .into_iter()
                .map(|x| sign * x)
                .collect())
        }
        fn similarity(&self, item_id: ItemId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
            self.inner.similarity(item_id, item_ids)
        }
    }

    impl EpochTrainable for Peaked {
        fn fit_epochs(&mut self, train: &Interactions, num_epochs: usize) -> Result<f32, FittingError> {
            if self.inner.state().is_none() {
                self.inner.fit(train)?;
            }
            self.epochs += num_epochs;
            Ok(0.0)
        }
        fn epochs(&self) -> usize {
            self.epochs
        }
    }

    impl Tunable for Peaked {
        fn unfitted(&self) -> Self {
            Peaked {
                inner: self.inner.unfitted(),
                epochs: 0,
                peak: self.peak,
            }
        }
        fn set_params(&mut self, _: &Params) -> Result<(), ConfigurationError> {
            Ok(())
        }
        fn guess_search_space(&self) -> SearchSpace {
            SearchSpace::new()
        }
    }

    fn peaked(peak: usize) -> Peaked {
        Peaked {
            inner: ItemCooccurrenceModel::default(),
            epochs: 0,
            peak,
        }
    }

    #[test]
    fn stops_after_patience_runs_out() {
        let (train, _) = testing::data();
        let config = EarlyStopConfig::new().epochs_step(2).epochs_max(100).stop_patience(2);

        let mut stopper = EarlyStopper::new(config).unwrap();
        let model = stopper.fit(&peaked(4), &train).unwrap();

        assert_eq!(stopper.trace().epochs, vec![2, 4, 6, 8]);
        assert_eq!(stopper.state(), EarlyStopState::Converged { best_epochs: 4 });
        assert_eq!(stopper.trace().argmax(Metric::NormalizedMrr), Some(4));
        assert_eq!(model.epochs(), 4);
    }

    #[test]
    fn stops_at_epochs_max() {
        let (train, _) = testing::data();
        let config = EarlyStopConfig::new().epochs_step(3).epochs_max(7).stop_patience(10);

        let mut stopper = EarlyStopper::new(config).unwrap();
        stopper.fit(&peaked(1000), &train).unwrap();

        assert_eq!(stopper.trace().epochs, vec![3, 6, 7]);
        assert_eq!(stopper.best_epochs(), stopper.trace().argmax(Metric::NormalizedMrr));
    }

    #[test]
    fn epochs_max_below_step_fails_before_training() {
        match EarlyStopper::new(EarlyStopConfig::new().epochs_max(5).epochs_step(10)) {
            Err(ConfigurationError::EpochsMaxBelowStep { epochs_max, epochs_step }) => {
                assert_eq!((epochs_max, epochs_step), (5, 10))
            }
            _ => panic!("Expected a configuration error"),
        }

        let (train, _) = testing::data();
        let mut model = Hyperparameters::new().build();
        let config = EarlyStopConfig::new().epochs_max(5).epochs_step(10);

        assert!(fit_with_early_stop(&mut model, &train, config).is_err());
        assert!(model.state().is_none());
    }

    #[test]
    fn early_stopped_factorization_reports_winning_epochs() {
        let (train, _) = testing::data();
        let mut model = Hyperparameters::new().num_epochs(1).learning_rate(0.02).build();
        let config = EarlyStopConfig::new()
            .epochs_step(2)
            .epochs_max(20)
            .k(10)
            .n_rec(Some(100));

        let stopper = fit_with_early_stop(&mut model, &train, config).unwrap();
        let best_epochs = stopper.best_epochs().unwrap();

        assert_eq!(stopper.trace().argmax(Metric::NormalizedMrr), Some(best_epochs));
        assert_eq!(model.epochs(), best_epochs);
        assert_ne!(best_epochs, 1);
        assert_eq!(
            model.fit_params()["epochs"],
            ::search::ParamValue::Int(best_epochs as i64)
        );
    }

    #[test]
    fn refit_uses_full_training_set() {
        let (train, _) = testing::data();
        let mut model = Hyperparameters::new().build();
        let config = EarlyStopConfig::new()
            .epochs_step(1)
            .epochs_max(3)
            .refit_on_all(true);

        let stopper = fit_with_early_stop(&mut model, &train, config).unwrap();

        assert_eq!(model.epochs(), stopper.best_epochs().unwrap());
        assert_eq!(model.state().unwrap().train_mat.nnz(), train.len());
    }
}
