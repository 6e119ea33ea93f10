//! Shared fixtures and the property suite every recommender must pass.
use std;
use std::time::Instant;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;

use data::{FilterMode, Interaction, Interactions};
use datasets::synthetic;
use evaluation::{evaluate, EvaluationParams};
use exclusion::ExclusionMask;
use metrics::Metric;
use Recommender;

pub const TESTING_USER_IDS: [&str; 4] = ["test_user_11", "test_user_22", "test_user_33", "test_user_44"];
pub const TESTING_ITEM_IDS: [&str; 4] = ["test_item_11", "test_item_22", "test_item_33", "test_item_44"];

const K: usize = 10;
const N: usize = 10;

/// Clustered synthetic data split 80/20, with the sanity block appended to
/// the training part.
pub fn data() -> (Interactions, Interactions) {
    let mut rng = XorShiftRng::from_seed([42; 16]);

    let observations = synthetic(&mut rng, 200, 300, 10, 20);
    let (mut train, test) = observations.split_train_test(&mut rng, 0.2, 1.0);
    train.extend(&testing_observations());

    (train, test)
}

/// Every test user interacts with every test item except the one sharing
/// its numeric suffix.
fn testing_observations() -> Interactions {
    let mut interactions = Interactions::new();

    for user in &TESTING_USER_IDS {
        for item in &TESTING_ITEM_IDS {
            if user[user.len() - 2..] != item[item.len() - 2..] {
                interactions.push(Interaction::new(*user, *item, 1.0));
            }
        }
    }

    interactions
}

/// Fit `model` on the fixture and check every recommender property.
pub fn check_recommender<R: Recommender + Sync>(model: &mut R) {
    let (train, test) = data();
    model.fit(&train).unwrap();

    check_get_recommendations(model);
    check_get_similar_items(model);
    check_predict_for_user(model);
    check_predictions_on_fake_data(model);
    check_exact_and_approximate_agree(model, &test);
    check_custom_exclusions(model, &train, &test);
}

fn check_get_recommendations<R: Recommender>(model: &R) {
    let recs = model.get_recommendations(&ExclusionMask::training(), None, N).unwrap();

    assert_eq!(recs.len(), model.all_users().len());
    for rec in &recs {
        assert_eq!(rec.item_ids.len(), N);
        assert_eq!(rec.predictions.len(), N);
        for pair in rec.predictions.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
    }
}

fn check_get_similar_items<R: Recommender>(model: &R) {
    let simils = model.get_similar_items(None, N).unwrap();

    assert_eq!(simils.len(), model.all_items().len());
    for simil in &simils {
        assert_eq!(simil.item_ids.len(), N);
        assert!(!simil.item_ids.contains(&simil.source_item_id));
        for pair in simil.predictions.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
    }
}

fn check_predict_for_user<R: Recommender>(model: &R) {
    let mask = ExclusionMask::training();
    let user = model.all_users()[0].clone();
    let items: Vec<&str> = model.all_items()[..50].iter().map(|x| x.as_str()).collect();

    let start = Instant::now();
    let plain = model.predict_for_user(&mask, &user, &items, false).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(plain.len(), items.len());
    for pair in plain.windows(2) {
        assert!(pair[0].prediction >= pair[1].prediction);
    }

    let slack = if cfg!(debug_assertions) { 10.0 } else { 1.0 };
    assert!(
        elapsed.as_secs_f64() < 0.06 * slack,
        "predict_for_user took {:?}",
        elapsed
    );

    // Blending with the input order moves early items up.
    let combined = model.predict_for_user(&mask, &user, &items, true).unwrap();
    let position = |preds: &[::Prediction], item: &str| preds.iter().position(|x| x.item_id == item).unwrap() as i64;
    let diffs: Vec<i64> = items
        .iter()
        .map(|item| position(&plain, item) - position(&combined, item))
        .collect();
    assert_eq!(diffs.iter().sum::<i64>(), 0);
    assert!(diffs[..diffs.len() / 2].iter().sum::<i64>() >= 0);

    // Training items score the minimum.
    let user_idx = model.user_inds(&[user.as_str()])[0].unwrap();
    let train_item_idx = model.train_mat().unwrap().get_user(user_idx).unwrap().item_ids[0];
    let train_item = model.item_ids(&[train_item_idx])[0].unwrap().to_owned();
    let mut with_train = items.clone();
    with_train.push(&train_item);
    let preds = model.predict_for_user(&mask, &user, &with_train, false).unwrap();
    let min = preds.iter().map(|x| x.prediction).fold(std::f32::INFINITY, f32::min);
    assert!(preds
        .iter()
        .filter(|x| x.item_id == train_item)
        .all(|x| x.prediction == min));

    // So do unknown items.
    let mut with_new = items.clone();
    with_new.push("new_item");
    let preds = model.predict_for_user(&mask, &user, &with_new, false).unwrap();
    let min = preds.iter().map(|x| x.prediction).fold(std::f32::INFINITY, f32::min);
    assert_eq!(preds.last().unwrap().item_id, "new_item");
    assert_eq!(preds.last().unwrap().prediction, min);

    // Unknown users get constant scores.
    let preds = model.predict_for_user(&mask, "new_user", &items, false).unwrap();
    assert!(preds.iter().all(|x| x.prediction == preds[0].prediction));
}

fn check_predictions_on_fake_data<R: Recommender>(model: &R) {
    for user in &TESTING_USER_IDS {
        let recs = model
            .get_recommendations(&ExclusionMask::training(), Some(&[*user][..]), 10)
            .unwrap();
        let expected = user.replace("user", "item");

        assert!(
            recs[0].item_ids.contains(&expected),
            "{} not recommended to {}: {:?}",
            expected,
            user,
            recs[0].item_ids
        );
    }

    for item in &TESTING_ITEM_IDS {
        let simils = model.get_similar_items(Some(&[*item][..]), 10).unwrap();
        let num_testing = simils[0]
            .item_ids
            .iter()
            .filter(|x| TESTING_ITEM_IDS.contains(&x.as_str()))
            .count();

        assert!(num_testing >= 3, "{} similar to {:?}", item, simils[0].item_ids);
    }
}

fn check_exact_and_approximate_agree<R: Recommender + Sync>(model: &R, test: &Interactions) {
    let mask = ExclusionMask::training();
    let exact = evaluate(model, &[("test", test)], &mask, &EvaluationParams::new(K)).unwrap();
    let approx = evaluate(model, &[("test", test)], &mask, &EvaluationParams::new(K).n_rec(200)).unwrap();

    assert_eq!(exact.columns(), approx.columns());

    for &metric in &Metric::ALL {
        let tolerance = match metric {
            Metric::Auc => 0.1,
            Metric::Coverage => 0.03,
            _ => 0.01,
        };
        let x = exact.value("test", metric).unwrap();
        let y = approx.value("test", metric).unwrap();

        assert!(
            (x - y).abs() <= tolerance * x.abs() + 1e-6,
            "{}: exact {} approximate {}",
            metric,
            x,
            y
        );
    }
}

fn check_custom_exclusions<R: Recommender + Sync>(model: &R, train: &Interactions, test: &Interactions) {
    let params = EvaluationParams::new(K).n_rec(200).include_train(true);
    let mrr = Metric::NormalizedMrr;

    let regular = evaluate(model, &[("test", test)], &ExclusionMask::training(), &params).unwrap();

    let mut rng = XorShiftRng::from_seed([7; 16]);
    let mut sample = test.data().to_vec();
    sample.shuffle(&mut rng);
    sample.truncate(test.len() / 2);
    let excluded = test.filter_by(&Interactions::from(sample), FilterMode::Keep);

    let sets = [("train_set", train), ("test", test), ("excluded", &excluded)];

    let mask = ExclusionMask::compose(model, &excluded, true).unwrap();
    let report = evaluate(model, &sets, &mask, &params).unwrap();
    let regular_train = regular.value("train", mrr).unwrap();
    let regular_test = regular.value("test", mrr).unwrap();

    assert!((report.value("train", mrr).unwrap() - regular_train).abs() < 0.05);
    assert!(regular_train > 0.0);
    assert_eq!(report.value("train_set", mrr).unwrap(), 0.0);
    assert_eq!(report.value("excluded", mrr).unwrap(), 0.0);
    // Half of the test positives are masked away.
    assert!(report.value("test", mrr).unwrap() < regular_test - 0.03);

    let mask = ExclusionMask::compose(model, &excluded, false).unwrap();
    let report = evaluate(model, &sets, &mask, &params).unwrap();

    assert!((report.value("train_set", mrr).unwrap() - regular_train).abs() < 0.05);
    assert_eq!(report.value("train_set", mrr), report.value("train", mrr));
    assert_eq!(report.value("excluded", mrr).unwrap(), 0.0);
    assert!(report.value("test", mrr).unwrap() < regular_test - 0.03);
}

#[test]
fn fixture_holds_out_the_sanity_pairs() {
    let (train, test) = data();

    assert_eq!(testing_observations().len(), 12);
    assert_eq!(train.filter_by(&test, FilterMode::Keep).len(), 0);
    assert_eq!(
        train
            .filter_by(&Interactions::from(vec![Interaction::new("test_user_11", "test_item_11", 1.0)]), FilterMode::Keep)
            .len(),
        0
    );
}
