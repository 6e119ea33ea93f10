//! Exclusion masks: the (user, item) pairs removed from candidate ranking.
//!
//! A mask combines the model's own training interactions (when
//! `exclude_training` is set) with any caller-supplied observation set.
//! Masks are plain values: composing a new one replaces the old one, and
//! the model is never mutated. Masked pairs are dropped from
//! recommendation lists, score `f32::MIN` in `predict_for_user`, and never
//! count as positives during evaluation.
use std::sync::Arc;

use data::{CompressedInteractions, Interactions};
use models::ModelState;
use {ItemId, PredictionError, Recommender, UserId};

/// Sparse boolean relation over (user index, item index).
#[derive(Clone, Debug)]
pub struct ExclusionMask {
    custom: Option<Arc<CompressedInteractions>>,
    exclude_training: bool,
}

impl Default for ExclusionMask {
    fn default() -> Self {
        ExclusionMask::training()
    }
}

impl ExclusionMask {
    /// Exclude the model's training interactions only.
    pub fn training() -> Self {
        ExclusionMask {
            custom: None,
            exclude_training: true,
        }
    }

    /// Exclude nothing.
    pub fn none() -> Self {
        ExclusionMask {
            custom: None,
            exclude_training: false,
        }
    }

    /// Compose a mask from `exclusions` and, if `exclude_training` is set,
    /// the model's training interactions. Pairs whose user or item the
    /// model does not know are dropped.
    pub fn compose<R: Recommender + ?Sized>(
        model: &R,
        exclusions: &Interactions,
        exclude_training: bool,
    ) -> Result<Self, PredictionError> {
        let state = model.state().ok_or(PredictionError::NotFitted)?;
        let custom = exclusions.to_compressed(&state.users, &state.items);

        debug!(
            "Composed exclusion mask with {} custom pairs (exclude_training: {})",
            custom.nnz(),
            exclude_training
        );

        Ok(ExclusionMask {
            custom: Some(Arc::new(custom)),
            exclude_training,
        })
    }

    /// Number of caller-supplied pairs.
    pub fn num_custom(&self) -> usize {
        self.custom.as_ref().map(|mat| mat.nnz()).unwrap_or(0)
    }

    /// The same custom exclusions, without the training interactions.
    pub fn without_training(&self) -> Self {
        ExclusionMask {
            custom: self.custom.clone(),
            exclude_training: false,
        }
    }

    /// Whether the pair is masked.
    pub fn is_excluded(&self, state: &ModelState, user_id: UserId, item_id: ItemId) -> bool {
        (self.exclude_training && state.train_mat.contains(user_id, item_id))
            || self
                .custom
                .as_ref()
                .map(|mat| mat.contains(user_id, item_id))
                .unwrap_or(false)
    }

    /// Sorted, de-duplicated item indices masked for `user_id`.
    pub fn excluded_items(&self, state: &ModelState, user_id: UserId) -> Vec<ItemId> {
        let mut items = Vec::new();

        if self.exclude_training {
            if let Some(user) = state.train_mat.get_user(user_id) {
                items.extend_from_slice(user.item_ids);
            }
        }

        if let Some(ref custom) = self.custom {
            if let Some(user) = custom.get_user(user_id) {
                items.extend_from_slice(user.item_ids);
            }
        }

        items.sort();
        items.dedup();

        items
    }
}
