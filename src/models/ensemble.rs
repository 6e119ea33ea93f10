//! Rank-combination ensembles.
//!
//! Each member ranks the requested items; an item's member score is
//! `1 - rank / n` and the ensemble score is the mean over members. Members
//! must share user and item indices, which holds whenever they were fitted
//! on the same observation set.
//!
//! [`CombinedRankEnsemble`] combines both predictions and similarities.
//! [`CombinedSimilarityEnsemble`] only combines similarities, and
//! recommends the items most similar to a user's training history.
use super::ModelState;
use data::Interactions;
use ranking::rank_candidates;
use search::Params;
use {FittingError, ItemId, PredictionError, Recommender, UserId};

/// A boxed ensemble member.
pub type Member = Box<dyn Recommender + Send + Sync>;

/// Averages the rank scores of its members.
pub struct CombinedRankEnsemble {
    models: Vec<Member>,
    state: Option<ModelState>,
}

fn shared_state(models: &[Member]) -> Result<Option<ModelState>, FittingError> {
    let mut states = models.iter().map(|model| model.state());

    let first = match states.next() {
        Some(Some(state)) => state,
        Some(None) => return Ok(None),
        None => return Err(FittingError::EmptyEnsemble),
    };

    for state in states {
        match state {
            Some(state) if state.same_index(first) => {}
            Some(_) => return Err(FittingError::IncompatibleModels),
            None => return Ok(None),
        }
    }

    Ok(Some(first.clone()))
}

fn rank_scores(scores: &[f32]) -> Vec<f32> {
    let num_items = scores.len();
    let order = rank_candidates(scores, (0..num_items).collect(), None);

    let mut rank_scores = vec![0.0; num_items];
    for (rank, &position) in order.iter().enumerate() {
        rank_scores[position] = 1.0 - rank as f32 / num_items as f32;
    }

    rank_scores
}

impl CombinedRankEnsemble {
    /// Combine `models`, which may be fitted or not. Fitted members must
    /// share user and item indices.
    pub fn new(models: Vec<Member>) -> Result<Self, FittingError> {
        let state = shared_state(&models)?;

        Ok(CombinedRankEnsemble { models, state })
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the ensemble has no members.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    fn combine<F>(&self, num_items: usize, member_scores: F) -> Result<Vec<f32>, PredictionError>
    where
        F: Fn(&Member) -> Result<Vec<f32>, PredictionError>,
    {
        if self.state.is_none() {
            return Err(PredictionError::NotFitted);
        }

        let mut combined = vec![0.0; num_items];

        for model in &self.models {
            let scores = rank_scores(&member_scores(model)?);

            for (total, score) in izip!(combined.iter_mut(), scores) {
                *total += score;
            }
        }

        let num_models = self.models.len() as f32;

        Ok(combined.into_iter().map(|total| total / num_models).collect())
    }
}

impl Recommender for CombinedRankEnsemble {
    fn fit(&mut self, train: &Interactions) -> Result<f32, FittingError> {
        if self.models.is_empty() {
            return Err(FittingError::EmptyEnsemble);
        }

        let mut loss = 0.0;
        for model in &mut self.models {
            loss += model.fit(train)?;
        }

        self.state = shared_state(&self.models)?;

        Ok(loss / self.models.len() as f32)
    }

    fn fit_params(&self) -> Params {
        self.models
            .iter()
            .enumerate()
            .flat_map(|(idx, model)| {
                model
                    .fit_params()
                    .into_iter()
                    .map(move |(name, value)| (format!("{}.{}", idx, name), value))
            })
            .collect()
    }

    fn state(&self) -> Option<&ModelState> {
        self.state.as_ref()
    }

    fn predict(&self, user_id: UserId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
        self.combine(item_ids.len(), |model| model.predict(user_id, item_ids))
    }

    fn similarity(&self, item_id: ItemId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
        self.combine(item_ids.len(), |model| model.similarity(item_id, item_ids))
    }
}

/// Recommends by combined item similarity to the user's training items.
pub struct CombinedSimilarityEnsemble {
    ranks: CombinedRankEnsemble,
}

impl CombinedSimilarityEnsemble {
    /// Combine `models`, which may be fitted or not. Fitted members must
    /// share user and item indices.
    pub fn new(models: Vec<Member>) -> Result<Self, FittingError> {
        Ok(CombinedSimilarityEnsemble {
            ranks: CombinedRankEnsemble::new(models)?,
        })
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    /// Whether the ensemble has no members.
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
}

impl Recommender for CombinedSimilarityEnsemble {
    fn fit(&mut self, train: &Interactions) -> Result<f32, FittingError> {
        self.ranks.fit(train)
    }

    fn fit_params(&self) -> Params {
        self.ranks.fit_params()
    }

    fn state(&self) -> Option<&ModelState> {
        self.ranks.state()
    }

    /// Mean combined similarity between each of `item_ids` and the user's
    /// distinct training items.
    fn predict(&self, user_id: UserId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
        let state = self.ranks.state().ok_or(PredictionError::NotFitted)?;
        let mut scores = vec![0.0; item_ids.len()];

        let history = match state.train_mat.get_user(user_id) {
            Some(user) => user.distinct_items(),
            None => return Ok(scores),
        };

        for &source in &history {
            let similarities = self.ranks.similarity(source, item_ids)?;

            for (total, similarity) in izip!(scores.iter_mut(), similarities) {
                *total += similarity;
            }
        }

        let num_sources = history.len().max(1) as f32;

        Ok(scores.into_iter().map(|total| total / num_sources).collect())
    }

    fn similarity(&self, item_id: ItemId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
        self.ranks.similarity(item_id, item_ids)
    }
}
