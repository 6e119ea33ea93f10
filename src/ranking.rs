//! Candidate ranking shared by serving and evaluation.
//!
//! Every ranked list is ordered by score descending, with ties broken by
//! ascending item index, so a top-N list is always a prefix of the full
//! ranking.
use std;
use std::cmp::Ordering;

use exclusion::ExclusionMask;
use models::ModelState;
use {ItemId, Prediction, PredictionError, Recommendations, Recommender, SimilarItems, UserId};

/// Score assigned to excluded and unknown items, and to every item of an
/// unknown user.
pub const UNKNOWN_SCORE: f32 = std::f32::MIN;

/// A ranked candidate list for one user.
#[derive(Clone, Debug)]
pub struct RankedItems {
    /// Item indices, best first.
    pub item_ids: Vec<ItemId>,
    /// Scores parallel to `item_ids`.
    pub scores: Vec<f32>,
    /// Number of non-excluded candidates the list was drawn from.
    pub num_candidates: usize,
}

fn check_finite(scores: &[f32]) -> Result<(), PredictionError> {
    if scores.iter().all(|score| score.is_finite()) {
        Ok(())
    } else {
        Err(PredictionError::InvalidPredictionValue)
    }
}

fn compare(scores: &[f32], a: ItemId, b: ItemId) -> Ordering {
    scores[b]
        .partial_cmp(&scores[a])
        .unwrap_or(Ordering::Equal)
        .then(a.cmp(&b))
}

/// Order `candidates` by `scores` (indexed by item), keeping the best
/// `limit` if given.
pub fn rank_candidates(scores: &[f32], mut candidates: Vec<ItemId>, limit: Option<usize>) -> Vec<ItemId> {
    if let Some(limit) = limit {
        if limit == 0 {
            return Vec::new();
        }
        if limit < candidates.len() {
            candidates.select_nth_unstable_by(limit - 1, |&a, &b| compare(scores, a, b));
            candidates.truncate(limit);
        }
    }

    candidates.sort_unstable_by(|&a, &b| compare(scores, a, b));

    candidates
}

/// Score the whole catalog for `user_id` and rank the non-excluded items.
/// `limit` of `None` ranks every candidate.
pub fn rank_user<R: Recommender + ?Sized>(
    model: &R,
    state: &ModelState,
    exclusions: &ExclusionMask,
    user_id: UserId,
    limit: Option<usize>,
) -> Result<RankedItems, PredictionError> {
    let all_items: Vec<ItemId> = (0..state.num_items()).collect();
    let scores = model.predict(user_id, &all_items)?;
    check_finite(&scores)?;

    let excluded = exclusions.excluded_items(state, user_id);
    let candidates: Vec<ItemId> = all_items
        .into_iter()
        .filter(|item| excluded.binary_search(item).is_err())
        .collect();
    let num_candidates = candidates.len();

    let item_ids = rank_candidates(&scores, candidates, limit);
    let ranked_scores = item_ids.iter().map(|&item| scores[item]).collect();

    Ok(RankedItems {
        item_ids,
        scores: ranked_scores,
        num_candidates,
    })
}

fn ids(state: &ModelState, item_ids: &[ItemId]) -> Vec<String> {
    item_ids
        .iter()
        .filter_map(|&idx| state.items.id(idx))
        .map(|id| id.to_owned())
        .collect()
}

/// See [`Recommender::predict_for_user`].
///
/// With `combine_original_order` the output order averages each item's
/// position in the model ranking with its position in `item_ids`, and the
/// reported predictions become that blended score.
pub fn predict_for_user<R: Recommender + ?Sized>(
    model: &R,
    exclusions: &ExclusionMask,
    user_id: &str,
    item_ids: &[&str],
    combine_original_order: bool,
) -> Result<Vec<Prediction>, PredictionError> {
    let state = model.state().ok_or(PredictionError::NotFitted)?;
    let mut scores = vec![UNKNOWN_SCORE; item_ids.len()];

    if let Some(user) = state.users.get(user_id) {
        let (positions, known): (Vec<usize>, Vec<ItemId>) = item_ids
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| state.items.get(id).map(|item| (pos, item)))
            .filter(|&(_, item)| !exclusions.is_excluded(state, user, item))
            .unzip();

        let known_scores = model.predict(user, &known)?;
        check_finite(&known_scores)?;

        for (&pos, &score) in positions.iter().zip(known_scores.iter()) {
            scores[pos] = score;
        }
    }

    // Stable, so ties keep the caller's order.
    let mut order: Vec<usize> = (0..item_ids.len()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));

    if combine_original_order {
        let num_items = item_ids.len();
        let mut model_rank = vec![0; num_items];
        for (rank, &pos) in order.iter().enumerate() {
            model_rank[pos] = rank;
        }

        let combined: Vec<usize> = (0..num_items).map(|pos| model_rank[pos] + pos).collect();
        order.sort_by_key(|&pos| (combined[pos], model_rank[pos]));

        for pos in 0..num_items {
            scores[pos] = 1.0 - combined[pos] as f32 / (2 * num_items) as f32;
        }
    }

    Ok(order
        .into_iter()
        .map(|pos| Prediction {
            user_id: user_id.to_owned(),
            item_id: item_ids[pos].to_owned(),
            prediction: scores[pos],
        })
        .collect())
}

/// See [`Recommender::get_recommendations`].
///
/// Unknown users get the first `n_rec` catalog items, all scored
/// `UNKNOWN_SCORE`. Lists are shorter than `n_rec` only when fewer
/// non-excluded candidates exist.
pub fn get_recommendations<R: Recommender + ?Sized>(
    model: &R,
    exclusions: &ExclusionMask,
    user_ids: Option<&[&str]>,
    n_rec: usize,
) -> Result<Vec<Recommendations>, PredictionError> {
    let state = model.state().ok_or(PredictionError::NotFitted)?;

    let requested: Vec<&str> = match user_ids {
        Some(user_ids) => user_ids.to_vec(),
        None => state.users.ids().iter().map(|id| id.as_str()).collect(),
    };

    requested
        .into_iter()
        .map(|user_id| {
            let (item_ids, predictions) = match state.users.get(user_id) {
                Some(user) => {
                    let ranked = rank_user(model, state, exclusions, user, Some(n_rec))?;
                    (ids(state, &ranked.item_ids), ranked.scores)
                }
                None => {
                    let item_ids: Vec<String> = state.items.ids().iter().take(n_rec).cloned().collect();
                    let predictions = vec![UNKNOWN_SCORE; item_ids.len()];
                    (item_ids, predictions)
                }
            };

            Ok(Recommendations {
                user_id: user_id.to_owned(),
                item_ids,
                predictions,
            })
        })
        .collect()
}

/// See [`Recommender::get_similar_items`].
pub fn get_similar_items<R: Recommender + ?Sized>(
    model: &R,
    item_ids: Option<&[&str]>,
    n_simil: usize,
) -> Result<Vec<SimilarItems>, PredictionError> {
    let state = model.state().ok_or(PredictionError::NotFitted)?;
    let all_items: Vec<ItemId> = (0..state.num_items()).collect();

    let requested: Vec<&str> = match item_ids {
        Some(item_ids) => item_ids.to_vec(),
        None => state.items.ids().iter().map(|id| id.as_str()).collect(),
    };

    requested
        .into_iter()
        .map(|source| {
            let (similar, predictions) = match state.items.get(source) {
                Some(source_idx) => {
                    let scores = model.similarity(source_idx, &all_items)?;
                    check_finite(&scores)?;

                    let candidates = all_items.iter().cloned().filter(|&item| item != source_idx).collect();
                    let ranked = rank_candidates(&scores, candidates, Some(n_simil));
                    let predictions = ranked.iter().map(|&item| scores[item]).collect();

                    (ids(state, &ranked), predictions)
                }
                None => {
                    let similar: Vec<String> = state.items.ids().iter().take(n_simil).cloned().collect();
                    let predictions = vec![UNKNOWN_SCORE; similar.len()];
                    (similar, predictions)
                }
            };

            Ok(SimilarItems {
                source_item_id: source.to_owned(),
                item_ids: similar,
                predictions,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::{Interaction, Interactions};
    use search::Params;
    use FittingError;

    /// Scores item `i` as `-(i as f32)` for every user, so lower indices
    /// rank higher.
    struct Descending {
        state: Option<ModelState>,
    }

    impl Recommender for Descending {
        fn fit(&mut self, train: &Interactions) -> Result<f32, FittingError> {
            self.state = Some(ModelState::new(train)?);
            Ok(0.0)
        }
        fn fit_params(&self) -> Params {
            Params::new()
        }
        fn state(&self) -> Option<&ModelState> {
            self.state.as_ref()
        }
        fn predict(&self, _: UserId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
            Ok(item_ids.iter().map(|&item| -(item as f32)).collect())
        }
        fn similarity(&self, item_id: ItemId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
            Ok(item_ids
                .iter()
                .map(|&item| -((item as f32) - (item_id as f32)).abs())
                .collect())
        }
    }

    fn fitted() -> Descending {
        let mut train = Interactions::new();
        for item in 0..10 {
            train.push(Interaction::new("u0", format!("i{}", item), 1.0));
        }
        train.push(Interaction::new("u1", "i3", 1.0));

        let mut model = Descending { state: None };
        model.fit(&train).unwrap();
        model
    }

    #[test]
    fn top_n_is_prefix_of_full_ranking() {
        let scores = vec![0.5, 0.1, 0.9, 0.5, 0.3, 0.9, 0.0];
        let candidates: Vec<ItemId> = (0..scores.len()).collect();

        let full = rank_candidates(&scores, candidates.clone(), None);
        assert_eq!(full, vec![2, 5, 0, 3, 4, 1, 6]);

        for limit in 1..scores.len() {
            let top = rank_candidates(&scores, candidates.clone(), Some(limit));
            assert_eq!(&top[..], &full[..limit]);
        }
    }

    #[test]
    fn recommendations_skip_training_items() {
        let model = fitted();

        let recs = model
            .get_recommendations(&ExclusionMask::training(), Some(&["u1"][..]), 3)
            .unwrap();

        assert_eq!(recs[0].item_ids, vec!["i0", "i1", "i2"]);

        let recs = model
            .get_recommendations(&ExclusionMask::training(), Some(&["u0"][..]), 3)
            .unwrap();

        assert!(recs[0].item_ids.is_empty());
    }

    #[test]
    fn recommendations_for_unknown_user_are_constant() {
        let model = fitted();

        let recs = model
            .get_recommendations(&ExclusionMask::training(), Some(&["nobody"][..]), 4)
            .unwrap();

        assert_eq!(recs[0].item_ids.len(), 4);
        assert!(recs[0].predictions.iter().all(|&x| x == UNKNOWN_SCORE));
    }

    #[test]
    fn predict_for_user_puts_masked_and_unknown_items_last() {
        let model = fitted();

        let preds = model
            .predict_for_user(
                &ExclusionMask::training(),
                "u1",
                &["i5", "i3", "new_item", "i1"],
                false,
            )
            .unwrap();

        let order: Vec<&str> = preds.iter().map(|x| x.item_id.as_str()).collect();
        assert_eq!(order, vec!["i1", "i5", "i3", "new_item"]);
        assert_eq!(preds[2].prediction, UNKNOWN_SCORE);
        assert_eq!(preds[3].prediction, UNKNOWN_SCORE);
    }

    #[test]
    fn predict_for_unknown_user_is_constant_in_input_order() {
        let model = fitted();

        let preds = model
            .predict_for_user(&ExclusionMask::training(), "nobody", &["i5", "i1", "i3"], false)
            .unwrap();

        let order: Vec<&str> = preds.iter().map(|x| x.item_id.as_str()).collect();
        assert_eq!(order, vec!["i5", "i1", "i3"]);
        assert!(preds.iter().all(|x| x.prediction == UNKNOWN_SCORE));
    }

    #[test]
    fn combining_original_order_promotes_early_items() {
        let model = fitted();
        let items = ["i9", "i8", "i7", "i6", "i5", "i4"];

        let plain = model
            .predict_for_user(&ExclusionMask::none(), "u1", &items, false)
            .unwrap();
        let combined = model
            .predict_for_user(&ExclusionMask::none(), "u1", &items, true)
            .unwrap();

        let position = |preds: &[Prediction], item: &str| {
            preds.iter().position(|x| x.item_id == item).unwrap() as i64
        };
        let diffs: Vec<i64> = items
            .iter()
            .map(|item| position(&plain, item) - position(&combined, item))
            .collect();

        assert_eq!(diffs.iter().sum::<i64>(), 0);
        assert!(diffs[..3].iter().sum::<i64>() >= 0);
        for pair in combined.windows(2) {
            assert!(pair[0].prediction >= pair[1].prediction);
        }
    }

    #[test]
    fn similar_items_exclude_source() {
        let model = fitted();

        let simils = model.get_similar_items(Some(&["i4"][..]), 2).unwrap();

        assert_eq!(simils[0].item_ids, vec!["i3", "i5"]);
    }
}
