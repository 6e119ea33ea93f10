//! Hyperparameter search.
//!
//! A [`SearchSpace`] maps hyperparameter names to [`Dimension`]s. The search
//! loop draws `n_iters` configurations at random from a seeded generator,
//! fits a fresh model per configuration on an internal train/validation
//! split, and scores it on the validation part. Trials are ranked by
//! `target_loss = -metric`, so lower is better. The winning configuration
//! is refit on the full training set before it is returned.
//!
//! A trial whose model fails to fit or predict is logged, recorded with an
//! infinite target loss and skipped. The search only fails if every trial
//! fails, in which case the last trial's error is returned.
use std;
use std::collections::BTreeMap;
use std::fmt;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use data::Interactions;
use evaluation::{metric_score, DEFAULT_N_REC};
use exclusion::ExclusionMask;
use metrics::Metric;
use {ConfigurationError, Error, Tunable};

/// A concrete hyperparameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Integer value.
    Int(i64),
    /// Real value.
    Float(f64),
    /// Categorical label.
    Str(String),
}

/// Named hyperparameter values, sorted by name.
pub type Params = BTreeMap<String, ParamValue>;

impl ParamValue {
    fn invalid(&self, name: &str) -> ConfigurationError {
        ConfigurationError::InvalidParameterValue {
            name: name.to_owned(),
            value: self.clone(),
        }
    }

    /// Read as a non-negative integer.
    pub fn as_usize(&self, name: &str) -> Result<usize, ConfigurationError> {
        match *self {
            ParamValue::Int(value) if value >= 0 => Ok(value as usize),
            _ => Err(self.invalid(name)),
        }
    }

    /// Read as a real number. Integers are accepted.
    pub fn as_f32(&self, name: &str) -> Result<f32, ConfigurationError> {
        match *self {
            ParamValue::Int(value) => Ok(value as f32),
            ParamValue::Float(value) => Ok(value as f32),
            ParamValue::Str(_) => Err(self.invalid(name)),
        }
    }

    /// Read as a label.
    pub fn as_str(&self, name: &str) -> Result<&str, ConfigurationError> {
        match *self {
            ParamValue::Str(ref value) => Ok(value),
            _ => Err(self.invalid(name)),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ParamValue::Int(value) => write!(f, "{}", value),
            ParamValue::Float(value) => write!(f, "{}", value),
            ParamValue::Str(ref value) => write!(f, "{}", value),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<usize> for ParamValue {
    fn from(value: usize) -> Self {
        ParamValue::Int(value as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<f32> for ParamValue {
    fn from(value: f32) -> Self {
        ParamValue::Float(f64::from(value))
    }
}

impl<'a> From<&'a str> for ParamValue {
    fn from(value: &'a str) -> Self {
        ParamValue::Str(value.to_owned())
    }
}

/// Sampling prior for real dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prior {
    /// Uniform on [low, high].
    Uniform,
    /// Uniform in log space; both bounds must be positive.
    LogUniform,
}

/// A hyperparameter's sampling distribution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Dimension {
    /// Integers in [low, high].
    Integer {
        /// Lower bound, inclusive.
        low: i64,
        /// Upper bound, inclusive.
        high: i64,
    },
    /// Reals in [low, high].
    Real {
        /// Lower bound.
        low: f64,
        /// Upper bound.
        high: f64,
        /// Sampling prior.
        prior: Prior,
    },
    /// One of a fixed set of values.
    Categorical(Vec<ParamValue>),
}

impl Dimension {
    /// Integers in [low, high].
    pub fn integer(low: i64, high: i64) -> Self {
        Dimension::Integer { low, high }
    }

    /// Reals in [low, high], uniform.
    pub fn real(low: f64, high: f64) -> Self {
        Dimension::Real {
            low,
            high,
            prior: Prior::Uniform,
        }
    }

    /// Reals in [low, high], log-uniform.
    pub fn log_uniform(low: f64, high: f64) -> Self {
        Dimension::Real {
            low,
            high,
            prior: Prior::LogUniform,
        }
    }

    /// One of `values`.
    pub fn categorical<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParamValue>,
    {
        Dimension::Categorical(values.into_iter().map(Into::into).collect())
    }

    /// Check the bounds are consistent.
    pub fn validate(&self, name: &str) -> Result<(), ConfigurationError> {
        let reason = match *self {
            Dimension::Integer { low, high } if low > high => Some("low exceeds high"),
            Dimension::Real { low, high, .. } if !(low.is_finite() && high.is_finite()) => {
                Some("bounds must be finite")
            }
            Dimension::Real { low, high, .. } if low > high => Some("low exceeds high"),
            Dimension::Real {
                low,
                high,
                prior: Prior::Uniform,
            } if !(high - low).is_finite() =>
            {
                Some("range is too wide to sample")
            }
            Dimension::Real {
                low,
                prior: Prior::LogUniform,
                ..
            } if low <= 0.0 =>
            {
                Some("log-uniform bounds must be positive")
            }
            Dimension::Real {
                low,
                high,
                prior: Prior::LogUniform,
            } if !(high.ln() - low.ln()).is_finite() =>
            {
                Some("log range is too wide to sample")
            }
            Dimension::Categorical(ref values) if values.is_empty() => Some("no values"),
            _ => None,
        };

        match reason {
            Some(reason) => Err(ConfigurationError::InvalidDimension {
                name: name.to_owned(),
                reason: reason.to_owned(),
            }),
            None => Ok(()),
        }
    }

    /// Draw a value. The dimension must be valid.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> ParamValue {
        match *self {
            Dimension::Integer { low, high } => ParamValue::Int(rng.gen_range(low..=high)),
            Dimension::Real { low, high, prior } => {
                if low == high {
                    return ParamValue::Float(low);
                }

                let value = match prior {
                    Prior::Uniform => rng.gen_range(low..high),
                    Prior::LogUniform => rng.gen_range(low.ln()..high.ln()).exp(),
                };

                ParamValue::Float(value.max(low).min(high))
            }
            Dimension::Categorical(ref values) => values[rng.gen_range(0..values.len())].clone(),
        }
    }

    /// Whether `value` could have been drawn from this dimension.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (&Dimension::Integer { low, high }, &ParamValue::Int(value)) => low <= value && value <= high,
            (&Dimension::Real { low, high, .. }, &ParamValue::Float(value)) => low <= value && value <= high,
            (&Dimension::Categorical(ref values), value) => values.contains(value),
            _ => false,
        }
    }
}

/// Named dimensions to search over.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    dimensions: BTreeMap<String, Dimension>,
}

impl SearchSpace {
    /// An empty space.
    pub fn new() -> Self {
        SearchSpace::default()
    }

    /// Add (or replace) a dimension.
    pub fn add(mut self, name: &str, dimension: Dimension) -> Self {
        self.insert(name, dimension);
        self
    }

    /// Add (or replace) a dimension in place.
    pub fn insert(&mut self, name: &str, dimension: Dimension) {
        self.dimensions.insert(name.to_owned(), dimension);
    }

    /// Dimension by name.
    pub fn get(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.get(name)
    }

    /// Dimension names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.dimensions.keys().cloned().collect()
    }

    /// Number of dimensions.
    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    /// Whether the space has no dimensions.
    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Check the space is non-empty and every dimension is consistent.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.is_empty() {
            return Err(ConfigurationError::EmptySearchSpace);
        }

        for (name, dimension) in &self.dimensions {
            dimension.validate(name)?;
        }

        Ok(())
    }

    /// Draw one configuration.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Params {
        self.dimensions
            .iter()
            .map(|(name, dimension)| (name.clone(), dimension.sample(rng)))
            .collect()
    }
}

/// Search loop settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    metric: Metric,
    k: usize,
    n_iters: usize,
    valid_ratio: f32,
    n_rec: Option<usize>,
    seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            metric: Metric::NormalizedMrr,
            k: 10,
            n_iters: 10,
            valid_ratio: 0.2,
            n_rec: Some(DEFAULT_N_REC),
            seed: 42,
        }
    }
}

impl SearchConfig {
    /// Default settings.
    pub fn new() -> Self {
        SearchConfig::default()
    }

    /// Set the metric to optimize.
    pub fn metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    /// Set the rank cutoff.
    pub fn k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Set the number of trials.
    pub fn n_iters(mut self, n_iters: usize) -> Self {
        self.n_iters = n_iters;
        self
    }

    /// Set the fraction of each user's interactions held out for validation.
    pub fn valid_ratio(mut self, valid_ratio: f32) -> Self {
        self.valid_ratio = valid_ratio;
        self
    }

    /// Set the number of recommendations per user for approximate
    /// evaluation; `None` evaluates exactly.
    pub fn n_rec(mut self, n_rec: Option<usize>) -> Self {
        self.n_rec = n_rec;
        self
    }

    /// Set the random seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check the settings.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.k == 0 {
            return Err(ConfigurationError::NonPositiveK);
        }
        if self.n_iters == 0 {
            return Err(ConfigurationError::NoIterations);
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

/// One evaluated configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trial {
    /// Sampled hyperparameters.
    pub params: Params,
    /// `-metric`, or infinity if the trial failed.
    pub target_loss: f32,
    /// Validation metric, if the trial succeeded.
    pub metric_value: Option<f32>,
}

/// One row per trial, in the order trials were run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrialReport {
    /// Optimized metric.
    pub metric: Metric,
    /// Rank cutoff.
    pub k: usize,
    /// Hyperparameter columns, sorted.
    pub param_names: Vec<String>,
    /// Trials.
    pub trials: Vec<Trial>,
}

impl TrialReport {
    /// Number of trials.
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    /// Whether there are no trials.
    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// The first trial with the lowest target loss.
    pub fn best(&self) -> Option<(usize, &Trial)> {
        self.trials.iter().enumerate().fold(None, |best, (idx, trial)| match best {
            Some((_, current)) if current.target_loss <= trial.target_loss => best,
            _ => Some((idx, trial)),
        })
    }
}

/// Search output.
#[derive(Debug)]
pub struct SearchResult<R> {
    /// Model refit with `best_params` on the full training set.
    pub best_model: R,
    /// Hyperparameters of the best trial.
    pub best_params: Params,
    /// All trials.
    pub report: TrialReport,
}

/// Random search over `space`, starting every trial from
/// `template.unfitted()`.
///
/// Every sampled configuration is applied to a scratch model before any
/// training, so unknown names and rejected values fail early.
pub fn hyper_param_search<R: Tunable + Sync>(
    template: &R,
    train: &Interactions,
    space: &SearchSpace,
    config: &SearchConfig,
) -> Result<SearchResult<R>, Error> {
    config.validate()?;
    space.validate()?;

    let mut rng = XorShiftRng::seed_from_u64(config.seed);

    let configurations: Vec<Params> = (0..config.n_iters).map(|_| space.sample(&mut rng)).collect();
    let mut scratch = template.unfitted();
    for params in &configurations {
        scratch.set_params(params)?;
    }

    let (fit_set, valid_set) = train.split_train_test(&mut rng, config.valid_ratio, 1.0);
    let exclusions = ExclusionMask::training();

    let mut report = TrialReport {
        metric: config.metric,
        k: config.k,
        param_names: space.names(),
        trials: Vec::with_capacity(config.n_iters),
    };
    let mut last_error = None;

    for (trial_idx, params) in configurations.into_iter().enumerate() {
        let mut model = template.unfitted();
        model.set_params(&params)?;

        let outcome = model.fit(&fit_set).map_err(Error::from).and_then(|_| {
            metric_score(
                &model,
                &valid_set,
                &exclusions,
                config.metric,
                config.k,
                config.n_rec,
            )
        });

        let trial = match outcome {
            Ok(value) => {
                info!(
                    "Trial {}/{}: {}@{} = {:.4} with {:?}",
                    trial_idx + 1,
                    config.n_iters,
                    config.metric,
                    config.k,
                    value,
                    params
                );
                Trial {
                    params,
                    target_loss: config.metric.target_loss(value),
                    metric_value: Some(value),
                }
            }
            Err(error) => {
                warn!(
                    "Trial {}/{} failed with {:?}: {}",
                    trial_idx + 1,
                    config.n_iters,
                    params,
                    error
                );
                last_error = Some(error);
                Trial {
                    params,
                    target_loss: std::f32::INFINITY,
                    metric_value: None,
                }
            }
        };

        report.trials.push(trial);
    }

    let best_params = match report.best() {
        Some((_, trial)) if trial.metric_value.is_some() => trial.params.clone(),
        _ => {
            return Err(last_error.unwrap_or(Error::Configuration(ConfigurationError::NoIterations)));
        }
    };

    let mut best_model = template.unfitted();
    best_model.set_params(&best_params)?;
    best_model.fit(train)?;

    info!("Best hyperparameters: {:?}", best_params);

    Ok(SearchResult {
        best_model,
        best_params,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::cooccurrence::ItemCooccurrenceModel;
    use models::factorization::Hyperparameters;
    use testing;
    use {FittingError, Recommender};

    #[test]
    fn dimensions_sample_within_bounds() {
        let mut rng = XorShiftRng::seed_from_u64(7);
        let dimensions = vec![
            Dimension::integer(-3, 5),
            Dimension::real(0.5, 1.5),
            Dimension::log_uniform(1e-4, 1e-1),
            Dimension::categorical(vec!["bpr", "warp"]),
            Dimension::real(2.0, 2.0),
        ];

        for dimension in &dimensions {
            dimension.validate("x").unwrap();
            for _ in 0..200 {
                assert!(dimension.contains(&dimension.sample(&mut rng)));
            }
        }
    }

    #[test]
    fn inconsistent_dimensions_are_rejected() {
        assert!(Dimension::integer(5, 1).validate("x").is_err());
        assert!(Dimension::log_uniform(0.0, 1.0).validate("x").is_err());
        assert!(Dimension::real(0.0, std::f64::INFINITY).validate("x").is_err());
        assert!(Dimension::real(-1e308, 1e308).validate("x").is_err());
        let wide = Dimension::real(-1e307, 1e307);
        wide.validate("x").unwrap();
        assert!(wide.contains(&wide.sample(&mut XorShiftRng::seed_from_u64(1))));
        assert!(Dimension::Categorical(Vec::new()).validate("x").is_err());
        assert!(SearchSpace::new().validate().is_err());
    }

    #[test]
    fn param_values_deserialize_untagged() {
        let params: Params = serde_json::from_str(r#"{"a": 3, "b": 0.5, "c": "warp"}"#).unwrap();

        assert_eq!(params["a"], ParamValue::Int(3));
        assert_eq!(params["b"], ParamValue::Float(0.5));
        assert_eq!(params["c"], ParamValue::Str("warp".to_owned()));
    }

    #[test]
    fn search_returns_best_trial_refit_on_full_train() {
        let (train, _) = testing::data();
        let space = SearchSpace::new().add("shrinkage", Dimension::real(0.0, 50.0));
        let config = SearchConfig::new().n_iters(4).k(5).n_rec(Some(50));

        let result = hyper_param_search(&ItemCooccurrenceModel::default(), &train, &space, &config).unwrap();

        assert_eq!(result.report.len(), 4);
        assert_eq!(
            result.best_params.keys().cloned().collect::<Vec<_>>(),
            space.names()
        );

        let (_, best) = result.report.best().unwrap();
        assert_eq!(best.params, result.best_params);
        for trial in &result.report.trials {
            assert!(trial.target_loss >= best.target_loss);
        }

        let state = result.best_model.state().unwrap();
        assert_eq!(state.train_mat.nnz(), train.len());
    }

    #[test]
    fn search_is_deterministic_given_seed() {
        let (train, _) = testing::data();
        let space = SearchSpace::new().add("shrinkage", Dimension::log_uniform(0.1, 100.0));
        let config = SearchConfig::new().n_iters(3).seed(123);

        let first = hyper_param_search(&ItemCooccurrenceModel::default(), &train, &space, &config).unwrap();
        let second = hyper_param_search(&ItemCooccurrenceModel::default(), &train, &space, &config).unwrap();

        let params = |report: &TrialReport| report.trials.iter().map(|x| x.params.clone()).collect::<Vec<_>>();
        assert_eq!(params(&first.report), params(&second.report));
        assert_eq!(first.best_params, second.best_params);
    }

    #[test]
    fn unknown_parameters_fail_before_training() {
        let (train, _) = testing::data();
        let space = SearchSpace::new().add("no_such_parameter", Dimension::integer(1, 3));

        match hyper_param_search(&ItemCooccurrenceModel::default(), &train, &space, &SearchConfig::new()) {
            Err(Error::Configuration(ConfigurationError::UnknownParameter(name))) => {
                assert_eq!(name, "no_such_parameter")
            }
            other => panic!("Unexpected result: {:?}", other.map(|x| x.best_params)),
        }
    }

    #[test]
    fn failing_trials_are_skipped() {
        let (train, _) = testing::data();
        let template = Hyperparameters::new().num_epochs(1).build();
        let space = SearchSpace::new().add("latent_dim", Dimension::categorical(vec![0usize, 8]));
        let config = SearchConfig::new().n_iters(12).seed(3);

        let result = hyper_param_search(&template, &train, &space, &config).unwrap();

        assert_eq!(result.best_params["latent_dim"], ParamValue::Int(8));
        for trial in &result.report.trials {
            if trial.params["latent_dim"] == ParamValue::Int(0) {
                assert!(trial.target_loss.is_infinite());
                assert!(trial.metric_value.is_none());
            }
        }
    }

    #[test]
    fn search_fails_when_every_trial_fails() {
        let (train, _) = testing::data();
        let template = Hyperparameters::new().num_epochs(1).build();
        let space = SearchSpace::new().add("latent_dim", Dimension::integer(0, 0));

        match hyper_param_search(&template, &train, &space, &SearchConfig::new().n_iters(2)) {
            Err(Error::Fitting(FittingError::InvalidHyperparameter { .. })) => {}
            other => panic!("Unexpected result: {:?}", other.map(|x| x.best_params)),
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(SearchConfig::new().n_iters(0).validate().is_err());
        assert!(SearchConfig::new().k(0).validate().is_err());
        assert!(SearchConfig::new().k(20).n_rec(Some(10)).validate().is_err());
        assert!(SearchConfig::new().valid_ratio(1.0).validate().is_err());
    }
}
