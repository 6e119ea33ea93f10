extern crate failure;
extern crate rand;
extern crate rand_xorshift;
extern crate rankeval;
extern crate serde_json;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate tracing;
extern crate tracing_subscriber;

use std::env;
use std::fs::File;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use tracing_subscriber::EnvFilter;

use rankeval::data::Interactions;
use rankeval::datasets::{download_movielens_100k, load_csv};
use rankeval::early_stop::{fit_with_early_stop, EarlyStopConfig};
use rankeval::evaluation::{evaluate, EvaluationParams};
use rankeval::exclusion::ExclusionMask;
use rankeval::metrics::Metric;
use rankeval::models::factorization::ImplicitFactorizationModel;
use rankeval::search::{hyper_param_search, Params, SearchConfig, TrialReport};
use rankeval::{Recommender, Tunable};

#[derive(Debug, Serialize)]
struct Results {
    best_params: Params,
    early_stopped_epochs: Option<usize>,
    test_mrr: Option<f32>,
    train_mrr: Option<f32>,
    elapsed: Duration,
    trials: TrialReport,
}

fn load(path: Option<String>) -> Result<Interactions, failure::Error> {
    match path {
        Some(path) => load_csv(&path),
        None => download_movielens_100k(),
    }
}

fn main() -> Result<(), failure::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let data = load(env::args().nth(1))?;
    let mut rng = XorShiftRng::seed_from_u64(42);

    let data = data.sample_observations(&mut rng, 1000, 1000);
    let (train, test) = data.split_train_test(&mut rng, 0.2, 1.0);
    info!("Train {} test {} interactions", train.len(), test.len());

    let start = Instant::now();

    let template = ImplicitFactorizationModel::default();
    let space = template.guess_search_space();
    let config = SearchConfig::new().metric(Metric::NormalizedMrr).k(10).n_iters(20);

    let search = hyper_param_search(&template, &train, &space, &config)?;
    info!("Best params {:?}", search.best_params);

    let mut model = search.best_model;
    let stopper = fit_with_early_stop(
        &mut model,
        &train,
        EarlyStopConfig::new().epochs_max(100).epochs_step(5),
    )?;
    info!("Early stopping settled on {:?} epochs", stopper.best_epochs());

    let report = evaluate(
        &model,
        &[("test", &test)],
        &ExclusionMask::training(),
        &EvaluationParams::new(10).include_train(true),
    )?;
    println!("{}", report);

    let results = Results {
        best_params: model.fit_params(),
        early_stopped_epochs: stopper.best_epochs(),
        test_mrr: report.value("test", Metric::NormalizedMrr),
        train_mrr: report.value("train", Metric::NormalizedMrr),
        elapsed: start.elapsed(),
        trials: search.report,
    };

    serde_json::to_writer_pretty(File::create("factorization_results.json")?, &results)?;

    Ok(())
}
