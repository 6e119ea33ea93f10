//! Implicit-feedback matrix factorization.
//!
//! Users and items are embedded in a shared latent space; the score of an
//! item for a user is the item bias plus the dot product of their
//! embeddings. Training runs stochastic gradient steps over shuffled
//! (user, positive item) pairs, each paired with a negative item drawn
//! in proportion to its popularity in the training data, under one of
//! three pairwise losses:
//!
//! - BPR: `ln(1 + exp(-(s_pos - s_neg)))`,
//! - hinge: `max(0, 1 - (s_pos - s_neg))`,
//! - WARP: the hinge loss on the first margin-violating negative found,
//!   weighted by the log of the estimated rank of the positive.
//!
//! Training is single-threaded and fully determined by the seed, and it can
//! be extended epoch by epoch, which is what early stopping relies on.
use ndarray::{Array1, Array2, ArrayViewMut1, Zip};
use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use super::{Loss, ModelState, Optimizer};
use data::Interactions;
use search::{Dimension, Params, SearchSpace};
use {ConfigurationError, EpochTrainable, FittingError, ItemId, PredictionError, Recommender, Tunable, UserId};

/// Hyperparameters describing the factorization model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hyperparameters {
    latent_dim: usize,
    learning_rate: f32,
    l2_penalty: f32,
    loss: Loss,
    optimizer: Optimizer,
    num_epochs: usize,
    seed: u64,
    max_warp_trials: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            latent_dim: 32,
            learning_rate: 0.05,
            l2_penalty: 0.0,
            loss: Loss::BPR,
            optimizer: Optimizer::Adagrad,
            num_epochs: 20,
            seed: 42,
            max_warp_trials: 50,
        }
    }
}

impl Hyperparameters {
    /// Build new hyperparameters.
    pub fn new() -> Self {
        Hyperparameters::default()
    }

    /// Set the latent dimensionality.
    pub fn latent_dim(mut self, latent_dim: usize) -> Self {
        self.latent_dim = latent_dim;
        self
    }

    /// Set the learning rate.
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the L2 penalty.
    pub fn l2_penalty(mut self, l2_penalty: f32) -> Self {
        self.l2_penalty = l2_penalty;
        self
    }

    /// Set the loss function.
    pub fn loss(mut self, loss: Loss) -> Self {
        self.loss = loss;
        self
    }

    /// Set the optimizer type.
    pub fn optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Set the number of epochs to run per each `fit` call.
    pub fn num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    /// Set the random seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the maximum number of negatives drawn per WARP step.
    pub fn max_warp_trials(mut self, max_warp_trials: usize) -> Self {
        self.max_warp_trials = max_warp_trials;
        self
    }

    /// Build the implicit factorization model.
    pub fn build(self) -> ImplicitFactorizationModel {
        let rng = XorShiftRng::seed_from_u64(self.seed);

        ImplicitFactorizationModel {
            hyper: self,
            state: None,
            params: None,
            epochs: 0,
            rng,
        }
    }

    fn check(&self) -> Result<(), FittingError> {
        let invalid = |name: &str, reason: &str| FittingError::InvalidHyperparameter {
            name: name.to_owned(),
            reason: reason.to_owned(),
        };

        if self.latent_dim == 0 {
            return Err(invalid("latent_dim", "must be positive"));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(invalid("learning_rate", "must be positive and finite"));
        }
        if !(self.l2_penalty >= 0.0 && self.l2_penalty.is_finite()) {
            return Err(invalid("l2_penalty", "must be non-negative and finite"));
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
struct Accumulators {
    user_embeddings: Array2<f32>,
    item_embeddings: Array2<f32>,
    item_biases: Array1<f32>,
}

impl Accumulators {
    fn new(num_users: usize, num_items: usize, latent_dim: usize) -> Self {
        Accumulators {
            user_embeddings: Array2::ones((num_users, latent_dim)),
            item_embeddings: Array2::ones((num_items, latent_dim)),
            item_biases: Array1::ones(num_items),
        }
    }
}

#[derive(Clone, Debug)]
struct Parameters {
    user_embeddings: Array2<f32>,
    item_embeddings: Array2<f32>,
    item_biases: Array1<f32>,
    accumulators: Option<Accumulators>,
}

fn embedding_init<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    let scale = 1.0 / (cols as f32).sqrt();
    let uniform = Uniform::new(-scale, scale);
    Array2::from_shape_fn((rows, cols), |_| uniform.sample(rng))
}

fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn update(param: ArrayViewMut1<f32>, accumulator: Option<ArrayViewMut1<f32>>, gradient: &Array1<f32>, learning_rate: f32) {
    match accumulator {
        Some(accumulator) => {
            Zip::from(param)
                .and(accumulator)
                .and(gradient)
                .for_each(|param, accumulator, &gradient| {
                    *accumulator += gradient * gradient;
                    *param -= learning_rate * gradient / accumulator.sqrt();
                });
        }
        None => {
            let mut param = param;
            param.scaled_add(-learning_rate, gradient);
        }
    }
}

fn update_bias(bias: &mut f32, accumulator: Option<&mut f32>, gradient: f32, learning_rate: f32) {
    match accumulator {
        Some(accumulator) => {
            *accumulator += gradient * gradient;
            *bias -= learning_rate * gradient / accumulator.sqrt();
        }
        None => *bias -= learning_rate * gradient,
    }
}

impl Parameters {
    fn new<R: Rng>(hyper: &Hyperparameters, num_users: usize, num_items: usize, rng: &mut R) -> Self {
        let accumulators = match hyper.optimizer {
            Optimizer::Adagrad => Some(Accumulators::new(num_users, num_items, hyper.latent_dim)),
            Optimizer::SGD => None,
        };

        Parameters {
            user_embeddings: embedding_init(num_users, hyper.latent_dim, rng),
            item_embeddings: embedding_init(num_items, hyper.latent_dim, rng),
            item_biases: Array1::zeros(num_items),
            accumulators,
        }
    }

    fn score(&self, user_id: UserId, item_id: ItemId) -> f32 {
        self.item_biases[item_id] + self.user_embeddings.row(user_id).dot(&self.item_embeddings.row(item_id))
    }

    /// One pairwise step. Returns the loss before the update.
    fn step<R: Rng>(
        &mut self,
        hyper: &Hyperparameters,
        user_id: UserId,
        positive: ItemId,
        negatives: &[ItemId],
        rng: &mut R,
    ) -> f32 {
        let num_items = self.item_biases.len();
        let positive_score = self.score(user_id, positive);

        let (negative, loss, gradient) = match hyper.loss {
            Loss::BPR | Loss::Hinge => {
                let negative = negatives[rng.gen_range(0..negatives.len())];
                let diff = positive_score - self.score(user_id, negative);

                match hyper.loss {
                    Loss::BPR => (negative, softplus(-diff), -1.0 / (1.0 + diff.exp())),
                    _ if diff < 1.0 => (negative, 1.0 - diff, -1.0),
                    _ => (negative, 0.0, 0.0),
                }
            }
            Loss::WARP => {
                let mut violation = None;

                for trial in 1..=hyper.max_warp_trials.max(1) {
                    let negative = negatives[rng.gen_range(0..negatives.len())];
                    let diff = positive_score - self.score(user_id, negative);

                    if negative != positive && diff < 1.0 {
                        violation = Some((negative, diff, trial));
                        break;
                    }
                }

                match violation {
                    Some((negative, diff, trials)) => {
                        let rank = ((num_items - 1) / trials) as f32;
                        let weight = (1.0 + rank).ln();
                        (negative, weight * (1.0 - diff), -weight)
                    }
                    None => return 0.0,
                }
            }
        };

        if negative == positive || gradient == 0.0 {
            return loss;
        }

        let l2 = hyper.l2_penalty;
        let learning_rate = hyper.learning_rate;

        let user = self.user_embeddings.row(user_id).to_owned();
        let positive_item = self.item_embeddings.row(positive).to_owned();
        let negative_item = self.item_embeddings.row(negative).to_owned();

        let user_gradient = (&positive_item - &negative_item) * gradient + &user * l2;
        let positive_gradient = &user * gradient + &positive_item * l2;
        let negative_gradient = &user * -gradient + &negative_item * l2;

        let accumulators = self.accumulators.as_mut();
        let (user_acc, item_acc, bias_acc) = match accumulators {
            Some(acc) => (
                Some(&mut acc.user_embeddings),
                Some(&mut acc.item_embeddings),
                Some(&mut acc.item_biases),
            ),
            None => (None, None, None),
        };

        update(
            self.user_embeddings.row_mut(user_id),
            user_acc.map(|acc| acc.row_mut(user_id)),
            &user_gradient,
            learning_rate,
        );

        match item_acc {
            Some(item_acc) => {
                update(
                    self.item_embeddings.row_mut(positive),
                    Some(item_acc.row_mut(positive)),
                    &positive_gradient,
                    learning_rate,
                );
                update(
                    self.item_embeddings.row_mut(negative),
                    Some(item_acc.row_mut(negative)),
                    &negative_gradient,
                    learning_rate,
                );
            }
            None => {
                update(self.item_embeddings.row_mut(positive), None, &positive_gradient, learning_rate);
                update(self.item_embeddings.row_mut(negative), None, &negative_gradient, learning_rate);
            }
        }

        match bias_acc {
            Some(bias_acc) => {
                update_bias(&mut self.item_biases[positive], Some(&mut bias_acc[positive]), gradient, learning_rate);
                update_bias(&mut self.item_biases[negative], Some(&mut bias_acc[negative]), -gradient, learning_rate);
            }
            None => {
                update_bias(&mut self.item_biases[positive], None, gradient, learning_rate);
                update_bias(&mut self.item_biases[negative], None, -gradient, learning_rate);
            }
        }

        loss
    }
}

/// Implicit factorization model.
#[derive(Clone, Debug)]
pub struct ImplicitFactorizationModel {
    hyper: Hyperparameters,
    state: Option<ModelState>,
    params: Option<Parameters>,
    epochs: usize,
    rng: XorShiftRng,
}

impl Default for ImplicitFactorizationModel {
    fn default() -> Self {
        Hyperparameters::new().build()
    }
}

impl ImplicitFactorizationModel {
    /// The model's hyperparameters.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// Drop optimizer state that is only needed for further training.
    /// Predictions are unchanged; training can still be resumed, with
    /// freshly initialised Adagrad accumulators.
    pub fn reduce_memory_for_serving(&mut self) {
        if let Some(ref mut params) = self.params {
            params.accumulators = None;
        }
    }

    /// Whether optimizer state is currently held.
    pub fn has_optimizer_state(&self) -> bool {
        self.params
            .as_ref()
            .map(|params| params.accumulators.is_some())
            .unwrap_or(false)
    }

    fn initialize(&mut self, train: &Interactions) -> Result<(), FittingError> {
        self.hyper.check()?;

        let state = ModelState::new(train)?;
        self.rng = XorShiftRng::seed_from_u64(self.hyper.seed);
        self.params = Some(Parameters::new(
            &self.hyper,
            state.num_users(),
            state.num_items(),
            &mut self.rng,
        ));
        self.state = Some(state);
        self.epochs = 0;

        Ok(())
    }

    fn train_epochs(&mut self, num_epochs: usize) -> Result<f32, FittingError> {
        let ImplicitFactorizationModel {
            ref hyper,
            ref state,
            ref mut params,
            ref mut epochs,
            ref mut rng,
        } = *self;

        let (state, params) = match (state.as_ref(), params.as_mut()) {
            (Some(state), Some(params)) => (state, params),
            _ => return Err(FittingError::NoInteractions),
        };

        if hyper.optimizer == Optimizer::Adagrad && params.accumulators.is_none() {
            params.accumulators = Some(Accumulators::new(
                state.num_users(),
                state.num_items(),
                hyper.latent_dim,
            ));
        }

        // Every observed item occurrence doubles as a popularity-weighted
        // negative sample.
        let triplets = state.train_mat.to_triplet();
        let mut order: Vec<usize> = (0..triplets.len()).collect();
        let mut loss = 0.0;

        for _ in 0..num_epochs {
            order.shuffle(rng);

            let mut epoch_loss = 0.0;
            for &idx in &order {
                epoch_loss += params.step(
                    hyper,
                    triplets.user_ids[idx],
                    triplets.item_ids[idx],
                    &triplets.item_ids,
                    rng,
                );
            }

            loss = epoch_loss / order.len().max(1) as f32;
            if !loss.is_finite() {
                return Err(FittingError::NonFiniteLoss);
            }

            *epochs += 1;
            debug!("Epoch {}: loss {:.5}", epochs, loss);
        }

        Ok(loss)
    }
}

impl Recommender for ImplicitFactorizationModel {
    fn fit(&mut self, train: &Interactions) -> Result<f32, FittingError> {
        self.initialize(train)?;

        let num_epochs = self.hyper.num_epochs;
        self.train_epochs(num_epochs)
    }

    fn fit_params(&self) -> Params {
        let epochs = if self.state.is_some() {
            self.epochs
        } else {
            self.hyper.num_epochs
        };

        let mut params = Params::new();
        params.insert("epochs".to_owned(), epochs.into());
        params.insert("latent_dim".to_owned(), self.hyper.latent_dim.into());
        params.insert("learning_rate".to_owned(), self.hyper.learning_rate.into());
        params.insert("l2_penalty".to_owned(), self.hyper.l2_penalty.into());
        params.insert("loss".to_owned(), self.hyper.loss.name().into());
        params.insert("optimizer".to_owned(), self.hyper.optimizer.name().into());
        params
    }

    fn state(&self) -> Option<&ModelState> {
        self.state.as_ref()
    }

    fn predict(&self, user_id: UserId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
        let params = self.params.as_ref().ok_or(PredictionError::NotFitted)?;
        let num_users = params.user_embeddings.nrows();
        let num_items = params.item_biases.len();

        Ok(item_ids
            .iter()
            .map(|&item_id| {
                if user_id < num_users && item_id < num_items {
                    params.score(user_id, item_id)
                } else {
                    0.0
                }
            })
            .collect())
    }

    fn similarity(&self, item_id: ItemId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
        let params = self.params.as_ref().ok_or(PredictionError::NotFitted)?;
        let num_items = params.item_biases.len();
        if item_id >= num_items {
            return Ok(vec![0.0; item_ids.len()]);
        }

        let source = params.item_embeddings.row(item_id);
        let source_norm = source.dot(&source).sqrt();

        Ok(item_ids
            .iter()
            .map(|&other| {
                if other >= num_items {
                    return 0.0;
                }

                let target = params.item_embeddings.row(other);
                let norm = source_norm * target.dot(&target).sqrt();

                if norm > 0.0 {
                    source.dot(&target) / norm
                } else {
                    0.0
                }
            })
            .collect())
    }
}

impl EpochTrainable for ImplicitFactorizationModel {
    fn fit_epochs(&mut self, train: &Interactions, num_epochs: usize) -> Result<f32, FittingError> {
        if self.params.is_none() {
            self.initialize(train)?;
        }

        self.train_epochs(num_epochs)
    }

    fn epochs(&self) -> usize {
        self.epochs
    }
}

impl Tunable for ImplicitFactorizationModel {
    fn unfitted(&self) -> Self {
        self.hyper.clone().build()
    }

    fn set_params(&mut self, params: &Params) -> Result<(), ConfigurationError> {
        for (name, value) in params {
            let invalid = || ConfigurationError::InvalidParameterValue {
                name: name.clone(),
                value: value.clone(),
            };

            match name.as_str() {
                "epochs" => self.hyper.num_epochs = value.as_usize(name)?,
                "latent_dim" => self.hyper.latent_dim = value.as_usize(name)?,
                "learning_rate" => self.hyper.learning_rate = value.as_f32(name)?,
                "l2_penalty" => self.hyper.l2_penalty = value.as_f32(name)?,
                "loss" => self.hyper.loss = Loss::from_name(value.as_str(name)?).ok_or_else(invalid)?,
                "optimizer" => {
                    self.hyper.optimizer = Optimizer::from_name(value.as_str(name)?).ok_or_else(invalid)?
                }
                "seed" => self.hyper.seed = value.as_usize(name)? as u64,
                _ => return Err(ConfigurationError::UnknownParameter(name.clone())),
            }
        }

        Ok(())
    }

    fn guess_search_space(&self) -> SearchSpace {
        SearchSpace::new()
            .add("epochs", Dimension::integer(5, 50))
            .add("latent_dim", Dimension::integer(8, 64))
            .add("learning_rate", Dimension::log_uniform(1e-3, 0.3))
            .add("l2_penalty", Dimension::log_uniform(1e-8, 1e-3))
            .add("loss", Dimension::categorical(vec!["bpr", "hinge", "warp"]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evaluation::metric_score;
    use exclusion::ExclusionMask;
    use metrics::Metric;
    use search::ParamValue;
    use testing;

    #[test]
    fn learns_better_than_random() {
        let (train, test) = testing::data();

        for &loss in &[Loss::BPR, Loss::Hinge, Loss::WARP] {
            let mut model = Hyperparameters::new().loss(loss).num_epochs(10).build();
            let training_loss = model.fit(&train).unwrap();
            assert!(training_loss.is_finite());

            let auc = metric_score(&model, &test, &ExclusionMask::training(), Metric::Auc, 10, None).unwrap();
            assert!(auc > 0.55, "{:?} AUC {}", loss, auc);
        }
    }

    #[test]
    fn fit_epochs_continues_training() {
        let (train, _) = testing::data();
        let mut model = Hyperparameters::new().num_epochs(3).build();

        model.fit_epochs(&train, 2).unwrap();
        assert_eq!(model.epochs(), 2);
        model.fit_epochs(&train, 3).unwrap();
        assert_eq!(model.epochs(), 5);
        assert_eq!(model.fit_params()["epochs"], ParamValue::Int(5));

        // A fresh fit restarts the count.
        model.fit(&train).unwrap();
        assert_eq!(model.epochs(), 3);
    }

    #[test]
    fn training_is_deterministic_given_seed() {
        let (train, _) = testing::data();
        let items: Vec<ItemId> = (0..20).collect();

        let mut first = Hyperparameters::new().num_epochs(2).seed(7).build();
        let mut second = Hyperparameters::new().num_epochs(2).seed(7).build();
        first.fit(&train).unwrap();
        second.fit(&train).unwrap();

        assert_eq!(first.predict(3, &items).unwrap(), second.predict(3, &items).unwrap());
    }

    #[test]
    fn invalid_hyperparameters_fail_at_fit() {
        let (train, _) = testing::data();

        assert!(Hyperparameters::new().latent_dim(0).build().fit(&train).is_err());
        assert!(Hyperparameters::new().learning_rate(0.0).build().fit(&train).is_err());
        assert!(Hyperparameters::new().build().fit(&Interactions::new()).is_err());
    }

    #[test]
    fn reducing_memory_keeps_predictions() {
        let (train, _) = testing::data();
        let items: Vec<ItemId> = (0..50).collect();

        let mut model = Hyperparameters::new().num_epochs(2).build();
        model.fit(&train).unwrap();
        let before = model.predict(0, &items).unwrap();

        assert!(model.has_optimizer_state());
        model.reduce_memory_for_serving();
        assert!(!model.has_optimizer_state());
        assert_eq!(model.predict(0, &items).unwrap(), before);

        model.fit_epochs(&train, 1).unwrap();
        assert!(model.has_optimizer_state());
    }

    #[test]
    fn set_params_round_trips_through_fit_params() {
        let mut model = ImplicitFactorizationModel::default();

        let mut params = Params::new();
        params.insert("epochs".to_owned(), ParamValue::Int(7));
        params.insert("latent_dim".to_owned(), ParamValue::Int(16));
        params.insert("learning_rate".to_owned(), ParamValue::Float(0.25));
        params.insert("l2_penalty".to_owned(), ParamValue::Float(0.5));
        params.insert("loss".to_owned(), ParamValue::Str("warp".to_owned()));
        params.insert("optimizer".to_owned(), ParamValue::Str("sgd".to_owned()));
        model.set_params(&params).unwrap();

        assert_eq!(model.fit_params(), params);

        let mut bad = Params::new();
        bad.insert("loss".to_owned(), ParamValue::Str("logistic".to_owned()));
        assert!(model.set_params(&bad).is_err());
    }

    #[test]
    fn guessed_space_is_valid_and_accepted() {
        let model = ImplicitFactorizationModel::default();
        let space = model.guess_search_space();
        space.validate().unwrap();

        let mut rng = XorShiftRng::seed_from_u64(1);
        let mut scratch = model.unfitted();
        scratch.set_params(&space.sample(&mut rng)).unwrap();
    }

    #[test]
    fn satisfies_recommender_properties() {
        let mut model = Hyperparameters::new().num_epochs(30).build();

        testing::check_recommender(&mut model);
    }
}
