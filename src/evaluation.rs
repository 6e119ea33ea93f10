//! Ranking evaluation.
//!
//! [`evaluate`] scores a fitted model against one or more held-out
//! observation sets and returns one report row per set. In exact mode
//! (`n_rec` of `None`) every non-excluded catalog item is ranked for every
//! test user; in approximate mode only each user's top `n_rec` items are
//! retrieved, through the same path `get_recommendations` uses.
//!
//! A test user is eligible when at least one of their held-out items is
//! known to the model. Held-out items that are masked are not positives,
//! so an eligible user may end up with no positives and score zero. A set
//! with no eligible users scores zero on every metric.
use std::fmt;

use itertools::Itertools;
use rayon::prelude::*;

use data::{CompressedInteractions, Interactions};
use exclusion::ExclusionMask;
use metrics::{Metric, UserMetrics};
use models::ModelState;
use ranking::rank_user;
use {ConfigurationError, Error, ItemId, PredictionError, Recommender, UserId};

/// Default number of recommendations retrieved per user in approximate
/// mode.
pub const DEFAULT_N_REC: usize = 200;

/// Evaluation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluationParams {
    /// Rank cutoff.
    pub k: usize,
    /// Recommendations retrieved per user; `None` evaluates exactly.
    pub n_rec: Option<usize>,
    /// Prefix for every metric column.
    pub prefix: String,
    /// Whether to prepend a `train` row scoring the training interactions.
    pub include_train: bool,
}

impl Default for EvaluationParams {
    fn default() -> Self {
        EvaluationParams {
            k: 10,
            n_rec: None,
            prefix: String::new(),
            include_train: false,
        }
    }
}

impl EvaluationParams {
    /// Exact evaluation at cutoff `k`.
    pub fn new(k: usize) -> Self {
        EvaluationParams {
            k,
            ..EvaluationParams::default()
        }
    }

    /// Evaluate approximately from the top `n_rec` items per user.
    pub fn n_rec(mut self, n_rec: usize) -> Self {
        self.n_rec = Some(n_rec);
        self
    }

    /// Evaluate exactly.
    pub fn exact(mut self) -> Self {
        self.n_rec = None;
        self
    }

    /// Set the column prefix.
    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_owned();
        self
    }

    /// Set whether to prepend a `train` row.
    pub fn include_train(mut self, include_train: bool) -> Self {
        self.include_train = include_train;
        self
    }

    /// Check the settings.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.k == 0 {
            return Err(ConfigurationError::NonPositiveK);
        }

        match self.n_rec {
            Some(n_rec) if n_rec < self.k => Err(ConfigurationError::NRecBelowK { n_rec, k: self.k }),
            _ => Ok(()),
        }
    }
}

/// One evaluated observation set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    /// Name of the observation set.
    pub name: String,
    /// Values in column order.
    pub values: Vec<f32>,
}

/// Metrics table: one row per observation set, one column per metric.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    /// Column prefix.
    pub prefix: String,
    /// Rank cutoff.
    pub k: usize,
    /// Metrics in column order.
    pub metrics: Vec<Metric>,
    /// Rows in input order, the `train` row first if requested.
    pub rows: Vec<ReportRow>,
}

impl MetricsReport {
    /// Prefixed column names.
    pub fn columns(&self) -> Vec<String> {
        self.metrics
            .iter()
            .map(|metric| format!("{}{}", self.prefix, metric.name(self.k)))
            .collect()
    }

    /// Row by observation set name.
    pub fn row(&self, name: &str) -> Option<&ReportRow> {
        self.rows.iter().find(|row| row.name == name)
    }

    /// A single value.
    pub fn value(&self, row: &str, metric: Metric) -> Option<f32> {
        let column = self.metrics.iter().position(|&x| x == metric)?;
        self.row(row).map(|row| row.values[column])
    }

    /// All values of one metric, in row order.
    pub fn column(&self, metric: Metric) -> Vec<f32> {
        match self.metrics.iter().position(|&x| x == metric) {
            Some(column) => self.rows.iter().map(|row| row.values[column]).collect(),
            None => Vec::new(),
        }
    }
}

impl fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "\t{}", self.columns().iter().join("\t"))?;

        for row in &self.rows {
            writeln!(
                f,
                "{}\t{}",
                row.name,
                row.values.iter().map(|value| format!("{:.4}", value)).join("\t")
            )?;
        }

        Ok(())
    }
}

/// Evaluate `model` on each named observation set.
///
/// The model is only read. The `train` row, if requested, scores the
/// model's own training matrix under the custom part of `exclusions`.
pub fn evaluate<R: Recommender + Sync + ?Sized>(
    model: &R,
    test_sets: &[(&str, &Interactions)],
    exclusions: &ExclusionMask,
    params: &EvaluationParams,
) -> Result<MetricsReport, Error> {
    params.validate()?;
    let state = model.state().ok_or(PredictionError::NotFitted)?;

    let mut rows = Vec::with_capacity(test_sets.len() + 1);

    if params.include_train {
        let values = evaluate_matrix(
            model,
            state,
            &state.train_mat,
            &exclusions.without_training(),
            params,
        )?;
        rows.push(ReportRow {
            name: "train".to_owned(),
            values,
        });
    }

    for &(name, test) in test_sets {
        let test_mat = test.to_compressed(&state.users, &state.items);
        let values = evaluate_matrix(model, state, &test_mat, exclusions, params)?;

        debug!("Evaluated {} ({} interactions): {:?}", name, test_mat.nnz(), values);

        rows.push(ReportRow {
            name: name.to_owned(),
            values,
        });
    }

    Ok(MetricsReport {
        prefix: params.prefix.clone(),
        k: params.k,
        metrics: Metric::ALL.to_vec(),
        rows,
    })
}

/// A single metric of `model` on `test`.
pub fn metric_score<R: Recommender + Sync + ?Sized>(
    model: &R,
    test: &Interactions,
    exclusions: &ExclusionMask,
    metric: Metric,
    k: usize,
    n_rec: Option<usize>,
) -> Result<f32, Error> {
    let params = EvaluationParams {
        n_rec,
        ..EvaluationParams::new(k)
    };
    let report = evaluate(model, &[("test", test)], exclusions, &params)?;

    Ok(report.column(metric).first().cloned().unwrap_or(0.0))
}

fn evaluate_matrix<R: Recommender + Sync + ?Sized>(
    model: &R,
    state: &ModelState,
    test_mat: &CompressedInteractions,
    exclusions: &ExclusionMask,
    params: &EvaluationParams,
) -> Result<Vec<f32>, PredictionError> {
    let k = params.k;
    let users: Vec<(UserId, Vec<ItemId>)> = test_mat
        .iter_users()
        .filter(|user| !user.item_ids.is_empty())
        .map(|user| (user.user_id, user.distinct_items()))
        .collect();

    if users.is_empty() {
        return Ok(vec![0.0; Metric::ALL.len()]);
    }

    let per_user = users
        .par_iter()
        .map(|&(user_id, ref items)| {
            let positives: Vec<ItemId> = items
                .iter()
                .cloned()
                .filter(|&item| !exclusions.is_excluded(state, user_id, item))
                .collect();

            let ranked = rank_user(model, state, exclusions, user_id, params.n_rec)?;
            let metrics = UserMetrics::compute(&ranked.item_ids, &positives, ranked.num_candidates, k);
            let top_k = ranked.item_ids.into_iter().take(k).collect::<Vec<_>>();

            Ok((metrics, top_k))
        })
        .collect::<Result<Vec<_>, PredictionError>>()?;

    let num_users = per_user.len() as f32;
    let mut covered = vec![false; state.num_items()];

    for &(_, ref top_k) in &per_user {
        for &item in top_k {
            covered[item] = true;
        }
    }

    let coverage = covered.iter().filter(|&&x| x).count() as f32 / state.num_items().max(1) as f32;

    Ok(Metric::ALL
        .iter()
        .map(|&metric| match metric {
            Metric::Coverage => coverage,
            _ => per_user.iter().map(|&(ref user, _)| user.get(metric)).sum::<f32>() / num_users,
        })
        .collect())
}
