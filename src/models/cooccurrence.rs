//! Item-to-item co-occurrence recommender.
//!
//! Two items are similar when the same users interacted with both. With
//! `c_ij` the number of users who interacted with both `i` and `j` and
//! `n_i` the number who interacted with `i`, the similarity is
//!
//! ```text
//! s_ij = c_ij / (sqrt(n_i * n_j) + shrinkage)
//! ```
//!
//! A user's score for an item is the summed similarity between that item
//! and every item in the user's training history.
use std::collections::HashMap;

use super::ModelState;
use data::Interactions;
use search::{Dimension, Params, SearchSpace};
use {ConfigurationError, FittingError, ItemId, PredictionError, Recommender, Tunable, UserId};

/// Hyperparameters of the co-occurrence model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hyperparameters {
    shrinkage: f32,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters { shrinkage: 5.0 }
    }
}

impl Hyperparameters {
    /// Default hyperparameters.
    pub fn new() -> Self {
        Hyperparameters::default()
    }

    /// Set the shrinkage added to the similarity denominator. Larger values
    /// discount similarities supported by few users.
    pub fn shrinkage(mut self, shrinkage: f32) -> Self {
        self.shrinkage = shrinkage;
        self
    }

    /// Build the model.
    pub fn build(self) -> ItemCooccurrenceModel {
        ItemCooccurrenceModel {
            hyper: self,
            state: None,
            neighbours: Vec::new(),
        }
    }
}

/// Co-occurrence model. Neighbour lists are sorted by item index.
#[derive(Clone, Debug)]
pub struct ItemCooccurrenceModel {
    hyper: Hyperparameters,
    state: Option<ModelState>,
    neighbours: Vec<Vec<(ItemId, f32)>>,
}

impl Default for ItemCooccurrenceModel {
    fn default() -> Self {
        Hyperparameters::new().build()
    }
}

impl ItemCooccurrenceModel {
    fn similarity_of(&self, source: ItemId, target: ItemId) -> f32 {
        self.neighbours
            .get(source)
            .and_then(|row| {
                row.binary_search_by_key(&target, |&(item, _)| item)
                    .ok()
                    .map(|idx| row[idx].1)
            })
            .unwrap_or(0.0)
    }
}

impl Recommender for ItemCooccurrenceModel {
    fn fit(&mut self, train: &Interactions) -> Result<f32, FittingError> {
        let state = ModelState::new(train)?;
        let num_items = state.num_items();

        let mut counts = vec![0.0_f32; num_items];
        let mut cooccurrences: Vec<HashMap<ItemId, f32>> = vec![HashMap::new(); num_items];

        for user in state.train_mat.iter_users() {
            let items = user.distinct_items();

            for (idx, &first) in items.iter().enumerate() {
                counts[first] += 1.0;

                for &second in &items[idx + 1..] {
                    *cooccurrences[first].entry(second).or_insert(0.0) += 1.0;
                    *cooccurrences[second].entry(first).or_insert(0.0) += 1.0;
                }
            }
        }

        let shrinkage = self.hyper.shrinkage;
        self.neighbours = cooccurrences
            .into_iter()
            .enumerate()
            .map(|(source, row)| {
                let mut row: Vec<(ItemId, f32)> = row
                    .into_iter()
                    .map(|(target, count)| {
                        let norm = (counts[source] * counts[target]).sqrt() + shrinkage;
                        (target, count / norm)
                    })
                    .collect();
                row.sort_by_key(|&(item, _)| item);
                row
            })
            .collect();

        debug!(
            "Fitted co-occurrence model over {} items with {} neighbour pairs",
            num_items,
            self.neighbours.iter().map(|row| row.len()).sum::<usize>()
        );

        self.state = Some(state);

        Ok(0.0)
    }

    fn fit_params(&self) -> Params {
        let mut params = Params::new();
        params.insert("shrinkage".to_owned(), self.hyper.shrinkage.into());
        params
    }

    fn state(&self) -> Option<&ModelState> {
        self.state.as_ref()
    }

    fn predict(&self, user_id: UserId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
        let state = self.state.as_ref().ok_or(PredictionError::NotFitted)?;
        let history = state
            .train_mat
            .get_user(user_id)
            .map(|user| user.distinct_items())
            .unwrap_or_default();

        Ok(item_ids
            .iter()
            .map(|&item| {
                history
                    .iter()
                    .map(|&source| self.similarity_of(source, item))
                    .sum()
            })
            .collect())
    }

    fn similarity(&self, item_id: ItemId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
        if self.state.is_none() {
            return Err(PredictionError::NotFitted);
        }

        Ok(item_ids
            .iter()
            .map(|&item| self.similarity_of(item_id, item))
            .collect())
    }
}

impl Tunable for ItemCooccurrenceModel {
    fn unfitted(&self) -> Self {
        self.hyper.clone().build()
    }

    fn set_params(&mut self, params: &Params) -> Result<(), ConfigurationError> {
        for (name, value) in params {
            match name.as_str() {
                "shrinkage" => {
                    let shrinkage = value.as_f32(name)?;
                    if !(shrinkage >= 0.0) {
                        return Err(ConfigurationError::InvalidParameterValue {
                            name: name.clone(),
                            value: value.clone(),
                        });
                    }
                    self.hyper.shrinkage = shrinkage;
                }
                _ => return Err(ConfigurationError::UnknownParameter(name.clone())),
            }
        }

        Ok(())
    }

    fn guess_search_space(&self) -> SearchSpace {
        SearchSpace::new().add("shrinkage", Dimension::real(0.0, 100.0))
    }
}
