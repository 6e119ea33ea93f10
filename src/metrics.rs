//! Ranking metrics.
//!
//! Per-user kernels take a ranked list of item indices (best first), the
//! user's sorted positives and the number of candidates the list was drawn
//! from. A list that covers every candidate gives exact values; a
//! truncated top-N list gives the approximate ones.
use std::fmt;

use ItemId;

/// A ranking metric. All metrics are higher-is-better and lie in [0, 1].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Probability a positive is ranked above a negative.
    Auc,
    /// Reciprocal-rank sum over the top k, normalized by the best
    /// achievable sum for the user's number of positives.
    NormalizedMrr,
    /// DCG over the top k, normalized by the ideal DCG.
    NormalizedDcg,
    /// Fraction of the top k that is relevant.
    Precision,
    /// Fraction of the positives found in the top k.
    Recall,
    /// Fraction of the catalog appearing in any user's top k.
    Coverage,
}

impl Metric {
    /// Every metric, in report column order.
    pub const ALL: [Metric; 6] = [
        Metric::Auc,
        Metric::NormalizedMrr,
        Metric::NormalizedDcg,
        Metric::Precision,
        Metric::Recall,
        Metric::Coverage,
    ];

    /// Column name at rank cutoff `k`.
    pub fn name(&self, k: usize) -> String {
        match *self {
            Metric::Auc => "AUC".to_owned(),
            Metric::NormalizedMrr => format!("n-MRR@{}", k),
            Metric::NormalizedDcg => format!("n-DCG@{}", k),
            Metric::Precision => format!("precision@{}", k),
            Metric::Recall => format!("recall@{}", k),
            Metric::Coverage => format!("coverage@{}", k),
        }
    }

    /// Position in [`Metric::ALL`].
    pub fn column(&self) -> usize {
        match *self {
            Metric::Auc => 0,
            Metric::NormalizedMrr => 1,
            Metric::NormalizedDcg => 2,
            Metric::Precision => 3,
            Metric::Recall => 4,
            Metric::Coverage => 5,
        }
    }

    /// Search loss for a metric value: lower is better.
    pub fn target_loss(&self, value: f32) -> f32 {
        -value
    }
}

impl Default for Metric {
    fn default() -> Self {
        Metric::NormalizedMrr
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Metric::Auc => "AUC",
            Metric::NormalizedMrr => "n-MRR",
            Metric::NormalizedDcg => "n-DCG",
            Metric::Precision => "precision",
            Metric::Recall => "recall",
            Metric::Coverage => "coverage",
        };
        write!(f, "{}", name)
    }
}

/// Per-user metric values.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UserMetrics {
    /// AUC.
    pub auc: f32,
    /// Normalized MRR@k.
    pub mrr: f32,
    /// Normalized DCG@k.
    pub ndcg: f32,
    /// Precision@k.
    pub precision: f32,
    /// Recall@k.
    pub recall: f32,
}

impl UserMetrics {
    /// Compute all per-user metrics.
    ///
    /// `positives` must be sorted and every positive must be a candidate.
    /// Users without positives score zero everywhere.
    pub fn compute(ranking: &[ItemId], positives: &[ItemId], num_candidates: usize, k: usize) -> Self {
        let num_positives = positives.len();
        if num_positives == 0 || k == 0 {
            return UserMetrics::default();
        }

        let relevant: Vec<bool> = ranking
            .iter()
            .map(|item| positives.binary_search(item).is_ok())
            .collect();
        let top_k = &relevant[..k.min(relevant.len())];
        let hits = top_k.iter().filter(|&&x| x).count();

        UserMetrics {
            auc: auc(&relevant, num_positives, num_candidates),
            mrr: normalized_mrr(top_k, num_positives, k),
            ndcg: normalized_dcg(top_k, num_positives, k),
            precision: hits as f32 / k as f32,
            recall: hits as f32 / num_positives as f32,
        }
    }

    /// Value of a per-user metric. Coverage is not per-user and reads as 0.
    pub fn get(&self, metric: Metric) -> f32 {
        match metric {
            Metric::Auc => self.auc,
            Metric::NormalizedMrr => self.mrr,
            Metric::NormalizedDcg => self.ndcg,
            Metric::Precision => self.precision,
            Metric::Recall => self.recall,
            Metric::Coverage => 0.0,
        }
    }
}

fn normalized_mrr(top_k: &[bool], num_positives: usize, k: usize) -> f32 {
    let score: f32 = top_k
        .iter()
        .enumerate()
        .filter(|&(_, &hit)| hit)
        .map(|(rank, _)| 1.0 / (rank + 1) as f32)
        .sum();
    let ideal: f32 = (1..=num_positives.min(k)).map(|rank| 1.0 / rank as f32).sum();

    score / ideal
}

fn normalized_dcg(top_k: &[bool], num_positives: usize, k: usize) -> f32 {
    let discount = |rank: usize| 1.0 / ((rank + 2) as f32).log2();

    let score: f32 = top_k
        .iter()
        .enumerate()
        .filter(|&(_, &hit)| hit)
        .map(|(rank, _)| discount(rank))
        .sum();
    let ideal: f32 = (0..num_positives.min(k)).map(discount).sum();

    score / ideal
}

/// AUC from a possibly truncated ranking.
///
/// Candidates missing from the ranking are assumed to rank below every
/// listed item. Pairs of two unlisted items (a positive against a negative)
/// get half credit.
fn auc(relevant: &[bool], num_positives: usize, num_candidates: usize) -> f32 {
    let num_negatives = num_candidates.saturating_sub(num_positives);
    if num_negatives == 0 {
        return 0.0;
    }

    let mut negatives_above = 0;
    let mut positives_listed = 0;
    let mut credit = 0.0;

    for &hit in relevant {
        if hit {
            positives_listed += 1;
            credit += (num_negatives - negatives_above) as f64;
        } else {
            negatives_above += 1;
        }
    }

    let positives_unlisted = num_positives - positives_listed;
    let negatives_unlisted = num_negatives.saturating_sub(negatives_above);
    credit += 0.5 * (positives_unlisted * negatives_unlisted) as f64;

    (credit / (num_positives * num_negatives) as f64) as f32
}
