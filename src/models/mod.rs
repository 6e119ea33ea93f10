//! Models module.
pub mod cooccurrence;
pub mod ensemble;
pub mod factorization;

use data::{CompressedInteractions, IdIndex, Interactions};
use FittingError;

/// What a fitted model knows about its training data: the user and item
/// indices built at fit time and the training interaction matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelState {
    /// User index.
    pub users: IdIndex,
    /// Item index.
    pub items: IdIndex,
    /// Training interactions over `users` x `items`.
    pub train_mat: CompressedInteractions,
}

impl ModelState {
    /// Index the training set.
    pub fn new(train: &Interactions) -> Result<Self, FittingError> {
        if train.is_empty() {
            return Err(FittingError::NoInteractions);
        }

        let users = train.users();
        let items = train.items();
        let train_mat = train.to_compressed(&users, &items);

        Ok(ModelState {
            users,
            items,
            train_mat,
        })
    }

    /// Number of known users.
    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    /// Number of known items.
    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    /// Whether both states index users and items identically.
    pub fn same_index(&self, other: &ModelState) -> bool {
        self.users.ids() == other.users.ids() && self.items.ids() == other.items.ids()
    }
}

/// The loss used for training the model.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Loss {
    /// Bayesian Personalised Ranking.
    BPR,
    /// Pairwise hinge loss.
    Hinge,
    /// WARP
    WARP,
}

impl Loss {
    /// Lower-case name, as used in hyperparameter maps.
    pub fn name(&self) -> &'static str {
        match *self {
            Loss::BPR => "bpr",
            Loss::Hinge => "hinge",
            Loss::WARP => "warp",
        }
    }

    /// Parse a lower-case name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bpr" => Some(Loss::BPR),
            "hinge" => Some(Loss::Hinge),
            "warp" => Some(Loss::WARP),
            _ => None,
        }
    }
}

/// Optimizer used to train the model.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Optimizer {
    /// Plain stochastic gradient descent.
    SGD,
    /// Adagrad.
    Adagrad,
}

impl Optimizer {
    /// Lower-case name, as used in hyperparameter maps.
    pub fn name(&self) -> &'static str {
        match *self {
            Optimizer::SGD => "sgd",
            Optimizer::Adagrad => "adagrad",
        }
    }

    /// Parse a lower-case name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sgd" => Some(Optimizer::SGD),
            "adagrad" => Some(Optimizer::Adagrad),
            _ => None,
        }
    }
}
