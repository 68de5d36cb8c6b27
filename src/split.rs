//! Deterministic train/test partitioning.
//!
//! One uniform draw per row from a generator seeded with `seed`; a row is in
//! the train split when its draw is below `ratio`. The test split is the exact
//! complement, so every row lands in exactly one split.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SplitConfig {
    /// Fraction of rows assigned to the train split, in `(0, 1)`.
    #[serde(default = "default_ratio")]
    pub ratio: f64,
    pub seed: u64,
    #[serde(default = "default_split")]
    pub split: Split,
}

fn default_ratio() -> f64 {
    0.8
}

fn default_split() -> Split {
    Split::Train
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            ratio: default_ratio(),
            seed: 1994,
            split: default_split(),
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.ratio > 0.0 && self.ratio < 1.0) {
            return Err(Error::config(format!(
                "split ratio must be in (0, 1), got {}",
                self.ratio
            )));
        }
        Ok(())
    }
}

/// Train-membership flag per metadata row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitMask {
    train: Vec<bool>,
}

impl SplitMask {
    pub fn new(seed: u64, ratio: f64, rows: usize) -> Result<Self> {
        SplitConfig {
            ratio,
            seed,
            split: Split::Train,
        }
        .validate()?;

        let mut rng = StdRng::seed_from_u64(seed);
        let train = (0..rows).map(|_| rng.gen::<f64>() < ratio).collect();
        Ok(Self { train })
    }

    pub fn from_config(config: &SplitConfig, rows: usize) -> Result<Self> {
        Self::new(config.seed, config.ratio, rows)
    }

    pub fn len(&self) -> usize {
        self.train.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train.is_empty()
    }

    /// Membership flags for `split`.
    pub fn mask(&self, split: Split) -> Vec<bool> {
        match split {
            Split::Train => self.train.clone(),
            Split::Test => self.train.iter().map(|m| !m).collect(),
        }
    }

    /// Row indices in `split`, ascending.
    pub fn indices(&self, split: Split) -> Vec<usize> {
        let want_train = split == Split::Train;
        self.train
            .iter()
            .enumerate()
            .filter(|(_, &m)| m == want_train)
            .map(|(i, _)| i)
            .collect()
    }

    /// Rows of `items` in `split`, reindexed from zero.
    pub fn select<T: Clone>(&self, items: &[T], split: Split) -> Vec<T> {
        self.indices(split)
            .into_iter()
            .filter_map(|i| items.get(i).cloned())
            .collect()
    }
}
