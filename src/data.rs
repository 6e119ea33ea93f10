//! Observation sets, id indices and sparse interaction matrices.
use std;
use std::collections::{HashMap, HashSet};
use std::hash::Hasher;

use rand::seq::SliceRandom;
use rand::Rng;

use siphasher::sip::SipHasher;

use super::{ItemId, UserId};

fn default_weight() -> f32 {
    1.0
}

/// A single user-item interaction.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Interaction {
    user_id: String,
    item_id: String,
    #[serde(default = "default_weight")]
    weight: f32,
}

impl Interaction {
    /// Build a new interaction.
    pub fn new<U: Into<String>, I: Into<String>>(user_id: U, item_id: I, weight: f32) -> Self {
        Interaction {
            user_id: user_id.into(),
            item_id: item_id.into(),
            weight,
        }
    }

    /// External user id.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
    /// External item id.
    pub fn item_id(&self) -> &str {
        &self.item_id
    }
    /// Interaction weight (rating or count).
    pub fn weight(&self) -> f32 {
        self.weight
    }
}

/// Shuffle and split interactions, returning `(train, test)`.
pub fn train_test_split<R: Rng>(
    interactions: &mut Interactions,
    rng: &mut R,
    test_fraction: f32,
) -> (Interactions, Interactions) {
    interactions.shuffle(rng);

    let (test, train) = interactions.split_at((test_fraction * interactions.len() as f32) as usize);

    (train, test)
}

/// Split so that every user lands entirely in either train or test.
pub fn user_based_split<R: Rng>(
    interactions: &Interactions,
    rng: &mut R,
    test_fraction: f32,
) -> (Interactions, Interactions) {
    let denominator = 100_000;
    let train_cutoff = (test_fraction * denominator as f32) as u64;

    let (key_0, key_1) = (rng.gen::<u64>(), rng.gen::<u64>());

    let is_train = |x: &Interaction| {
        let mut hasher = SipHasher::new_with_keys(key_0, key_1);
        hasher.write(x.user_id().as_bytes());
        hasher.finish() % denominator > train_cutoff
    };

    interactions.split_by(is_train)
}

/// How `Interactions::filter_by` treats matching pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterMode {
    /// Keep only pairs present in the other set.
    Keep,
    /// Drop pairs present in the other set.
    Remove,
}

/// An ordered set of observations. Duplicate (user, item) pairs are kept
/// and treated as repeated signals.
#[derive(Clone, Debug, Default)]
pub struct Interactions {
    interactions: Vec<Interaction>,
}

impl Interactions {
    /// An empty observation set.
    pub fn new() -> Self {
        Interactions {
            interactions: Vec::new(),
        }
    }

    /// The raw interactions.
    pub fn data(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Number of interactions.
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// Whether there are no interactions.
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Append a single interaction.
    pub fn push(&mut self, interaction: Interaction) {
        self.interactions.push(interaction);
    }

    /// Append all interactions of `other`.
    pub fn extend(&mut self, other: &Interactions) {
        self.interactions.extend_from_slice(&other.interactions);
    }

    /// Shuffle interactions in place.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        self.interactions.shuffle(rng);
    }

    /// Split at a position, returning `(head, tail)`.
    pub fn split_at(&self, idx: usize) -> (Self, Self) {
        let idx = idx.min(self.len());
        let head = Interactions {
            interactions: self.interactions[..idx].to_owned(),
        };
        let tail = Interactions {
            interactions: self.interactions[idx..].to_owned(),
        };

        (head, tail)
    }

    /// Split by a predicate, returning `(matching, rest)`.
    pub fn split_by<F: Fn(&Interaction) -> bool>(&self, func: F) -> (Self, Self) {
        let (head, tail): (Vec<Interaction>, Vec<Interaction>) =
            self.interactions.iter().cloned().partition(|x| func(x));

        (
            Interactions { interactions: head },
            Interactions { interactions: tail },
        )
    }

    /// Distinct user ids, in order of first appearance.
    pub fn users(&self) -> IdIndex {
        IdIndex::from_ids(self.interactions.iter().map(|x| x.user_id()))
    }

    /// Distinct item ids, in order of first appearance.
    pub fn items(&self) -> IdIndex {
        IdIndex::from_ids(self.interactions.iter().map(|x| x.item_id()))
    }

    /// Split into `(train, test)`: a `users_ratio` fraction of users is
    /// selected, and `ratio` of each selected user's interactions move to
    /// the test set.
    pub fn split_train_test<R: Rng>(&self, rng: &mut R, ratio: f32, users_ratio: f32) -> (Self, Self) {
        let users = self.users();

        let mut by_user: Vec<Vec<usize>> = vec![Vec::new(); users.len()];
        for (idx, interaction) in self.interactions.iter().enumerate() {
            if let Some(user) = users.get(interaction.user_id()) {
                by_user[user].push(idx);
            }
        }

        let mut user_order: Vec<UserId> = (0..users.len()).collect();
        user_order.shuffle(rng);
        let num_selected = (users_ratio.max(0.0).min(1.0) * users.len() as f32).round() as usize;

        let mut is_test = vec![false; self.len()];
        for &user in &user_order[..num_selected] {
            let rows = &mut by_user[user];
            rows.shuffle(rng);
            let num_test = (ratio * rows.len() as f32).round() as usize;
            for &row in &rows[..num_test.min(rows.len())] {
                is_test[row] = true;
            }
        }

        let mut train = Interactions::new();
        let mut test = Interactions::new();
        for (interaction, &test_row) in self.interactions.iter().zip(is_test.iter()) {
            if test_row {
                test.push(interaction.clone());
            } else {
                train.push(interaction.clone());
            }
        }

        (train, test)
    }

    /// Restrict to a random sample of at most `n_users` users and
    /// `n_items` items.
    pub fn sample_observations<R: Rng>(&self, rng: &mut R, n_users: usize, n_items: usize) -> Self {
        let users = sample_ids(&self.users(), n_users, rng);
        let items = sample_ids(&self.items(), n_items, rng);

        Interactions {
            interactions: self
                .interactions
                .iter()
                .filter(|x| users.contains(x.user_id()) && items.contains(x.item_id()))
                .cloned()
                .collect(),
        }
    }

    /// Keep or drop the (user, item) pairs that also appear in `other`.
    pub fn filter_by(&self, other: &Interactions, mode: FilterMode) -> Self {
        let pairs: HashSet<(&str, &str)> = other
            .interactions
            .iter()
            .map(|x| (x.user_id(), x.item_id()))
            .collect();

        Interactions {
            interactions: self
                .interactions
                .iter()
                .filter(|x| {
                    let present = pairs.contains(&(x.user_id(), x.item_id()));
                    match mode {
                        FilterMode::Keep => present,
                        FilterMode::Remove => !present,
                    }
                })
                .cloned()
                .collect(),
        }
    }

    /// Compress into a user-major sparse matrix over the given indices.
    /// Interactions with ids unknown to either index are dropped.
    pub fn to_compressed(&self, users: &IdIndex, items: &IdIndex) -> CompressedInteractions {
        let mut data: Vec<(UserId, ItemId, f32)> = self
            .interactions
            .iter()
            .filter_map(|x| match (users.get(x.user_id()), items.get(x.item_id())) {
                (Some(user), Some(item)) => Some((user, item, x.weight())),
                _ => None,
            })
            .collect();

        data.sort_by_key(|&(user, item, _)| (user, item));

        let mut user_pointers = vec![0; users.len() + 1];
        let mut item_ids = Vec::with_capacity(data.len());
        let mut weights = Vec::with_capacity(data.len());

        for &(user, item, weight) in &data {
            item_ids.push(item);
            weights.push(weight);

            user_pointers[user + 1] += 1;
        }

        for idx in 1..user_pointers.len() {
            user_pointers[idx] += user_pointers[idx - 1];
        }

        CompressedInteractions {
            num_users: users.len(),
            num_items: items.len(),
            user_pointers,
            item_ids,
            weights,
        }
    }
}

fn sample_ids<R: Rng>(index: &IdIndex, n: usize, rng: &mut R) -> HashSet<String> {
    let mut ids = index.ids().to_vec();
    ids.shuffle(rng);
    ids.truncate(n);
    ids.into_iter().collect()
}

impl From<Vec<Interaction>> for Interactions {
    fn from(data: Vec<Interaction>) -> Interactions {
        Interactions { interactions: data }
    }
}

/// Bidirectional mapping between external string ids and dense indices.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IdIndex {
    ids: Vec<String>,
    lookup: HashMap<String, usize>,
}

impl IdIndex {
    /// An empty index.
    pub fn new() -> Self {
        IdIndex::default()
    }

    /// Index ids in order of first appearance.
    pub fn from_ids<'a, I: IntoIterator<Item = &'a str>>(ids: I) -> Self {
        let mut index = IdIndex::new();
        for id in ids {
            index.insert(id);
        }
        index
    }

    /// Add an id if it is not present, returning its index.
    pub fn insert(&mut self, id: &str) -> usize {
        if let Some(&idx) = self.lookup.get(id) {
            return idx;
        }

        let idx = self.ids.len();
        self.ids.push(id.to_owned());
        self.lookup.insert(id.to_owned(), idx);

        idx
    }

    /// Index of `id`, if known.
    pub fn get(&self, id: &str) -> Option<usize> {
        self.lookup.get(id).cloned()
    }

    /// External id at `idx`, if in range.
    pub fn id(&self, idx: usize) -> Option<&str> {
        self.ids.get(idx).map(|x| x.as_str())
    }

    /// All ids in index order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Number of ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// User-major sparse interaction matrix. Item indices within a user's row
/// are sorted.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressedInteractions {
    num_users: usize,
    num_items: usize,
    user_pointers: Vec<usize>,
    item_ids: Vec<ItemId>,
    weights: Vec<f32>,
}

impl CompressedInteractions {
    /// Iterate over all user rows, including empty ones.
    pub fn iter_users(&self) -> CompressedInteractionsUserIterator {
        CompressedInteractionsUserIterator {
            interactions: self,
            idx: 0,
        }
    }

    /// The row of `user_id`, if in range.
    pub fn get_user(&self, user_id: UserId) -> Option<CompressedInteractionsUser> {
        if user_id >= self.num_users {
            return None;
        }

        let start = self.user_pointers[user_id];
        let stop = self.user_pointers[user_id + 1];

        Some(CompressedInteractionsUser {
            user_id,
            item_ids: &self.item_ids[start..stop],
            weights: &self.weights[start..stop],
        })
    }

    /// Whether the (user, item) pair has at least one entry.
    pub fn contains(&self, user_id: UserId, item_id: ItemId) -> bool {
        self.get_user(user_id)
            .map(|user| user.item_ids.binary_search(&item_id).is_ok())
            .unwrap_or(false)
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.item_ids.len()
    }

    /// Number of user rows.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of item columns.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// `(num_users, num_items)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }

    /// Flatten into parallel triplet arrays.
    pub fn to_triplet(&self) -> TripletInteractions {
        TripletInteractions::from(self)
    }
}

/// Iterator over the rows of a `CompressedInteractions`.
pub struct CompressedInteractionsUserIterator<'a> {
    interactions: &'a CompressedInteractions,
    idx: usize,
}

/// One user row of a `CompressedInteractions`.
#[derive(Debug)]
pub struct CompressedInteractionsUser<'a> {
    /// User index.
    pub user_id: UserId,
    /// Sorted item indices.
    pub item_ids: &'a [ItemId],
    /// Weights parallel to `item_ids`.
    pub weights: &'a [f32],
}

impl<'a> CompressedInteractionsUser<'a> {
    /// Sorted, de-duplicated item indices.
    pub fn distinct_items(&self) -> Vec<ItemId> {
        let mut items = self.item_ids.to_vec();
        items.dedup();
        items
    }
}

impl<'a> Iterator for CompressedInteractionsUserIterator<'a> {
    type Item = CompressedInteractionsUser<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let value = if self.idx >= self.interactions.num_users {
            None
        } else {
            let start = self.interactions.user_pointers[self.idx];
            let stop = self.interactions.user_pointers[self.idx + 1];

            Some(CompressedInteractionsUser {
                user_id: self.idx,
                item_ids: &self.interactions.item_ids[start..stop],
                weights: &self.interactions.weights[start..stop],
            })
        };

        self.idx += 1;

        value
    }
}

/// Interactions as parallel (user, item, weight) arrays.
#[derive(Clone, Debug)]
pub struct TripletInteractions {
    num_users: usize,
    num_items: usize,
    /// User indices.
    pub user_ids: Vec<UserId>,
    /// Item indices.
    pub item_ids: Vec<ItemId>,
    /// Weights.
    pub weights: Vec<f32>,
}

impl TripletInteractions {
    /// Number of triplets.
    pub fn len(&self) -> usize {
        self.user_ids.len()
    }

    /// Whether there are no triplets.
    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
    }

    /// Number of user rows of the source matrix.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of item columns of the source matrix.
    pub fn num_items(&self) -> usize {
        self.num_items
    }
}

impl<'a> From<&'a CompressedInteractions> for TripletInteractions {
    fn from(interactions: &'a CompressedInteractions) -> Self {
        let mut user_ids = Vec::with_capacity(interactions.nnz());
        for user in interactions.iter_users() {
            user_ids.extend(std::iter::repeat(user.user_id).take(user.item_ids.len()));
        }

        TripletInteractions {
            num_users: interactions.num_users,
            num_items: interactions.num_items,
            user_ids,
            item_ids: interactions.item_ids.clone(),
            weights: interactions.weights.clone(),
        }
    }
}
