//! Class-imbalance correction by upsampling with replacement.
//!
//! The majority class is the modal label (ties go to the smallest label).
//! Every other class is resampled with replacement up to the majority count,
//! then the combined table is permuted.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::metadata::MetadataRecord;

// Keeps the balance stream independent of the split stream for the same seed.
const BALANCE_STREAM: u64 = 0x5851_F42D_4C95_7F2D;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub enabled: bool,
    /// When set, labels must lie in `0..num_classes` and every class must
    /// have at least one row.
    pub num_classes: Option<usize>,
}

/// Row counts per class label.
pub fn class_counts(records: &[MetadataRecord]) -> Result<BTreeMap<i64, usize>> {
    let mut counts = BTreeMap::new();
    for record in records {
        let class = record.label.class().ok_or_else(|| {
            Error::config(format!(
                "item {} has no class label; balancing needs class labels",
                record.item_id
            ))
        })?;
        *counts.entry(class).or_insert(0) += 1;
    }
    Ok(counts)
}

/// Upsample every minority class to the majority count and permute.
pub fn balance(records: &[MetadataRecord], config: &BalanceConfig, seed: u64) -> Result<Vec<MetadataRecord>> {
    if records.is_empty() {
        return Err(Error::config("cannot balance an empty table"));
    }
    let counts = class_counts(records)?;

    if let Some(n) = config.num_classes {
        for class in 0..n as i64 {
            if !counts.contains_key(&class) {
                return Err(Error::config(format!("class {class} has no rows")));
            }
        }
        if let Some((&class, _)) = counts.iter().find(|(&c, _)| c < 0 || c >= n as i64) {
            return Err(Error::config(format!("label {class} outside 0..{n}")));
        }
    }

    let (&majority, &target) = counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .ok_or_else(|| Error::config("cannot balance an empty table"))?;

    let mut rng = StdRng::seed_from_u64(seed ^ BALANCE_STREAM);
    let mut balanced = Vec::with_capacity(target * counts.len());

    for &class in counts.keys() {
        let group: Vec<&MetadataRecord> = records
            .iter()
            .filter(|r| r.label.class() == Some(class))
            .collect();
        if class == majority {
            balanced.extend(group.into_iter().cloned());
        } else {
            balanced.extend((0..target).map(|_| group[rng.gen_range(0..group.len())].clone()));
        }
    }

    balanced.shuffle(&mut rng);
    tracing::debug!(
        rows = records.len(),
        balanced = balanced.len(),
        classes = counts.len(),
        majority,
        "balanced classes"
    );
    Ok(balanced)
}
