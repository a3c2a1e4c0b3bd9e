use std::collections::{BTreeMap, BTreeSet};

use super::model::{ImageBatch, MetadataValue, Signature};

// ---------------------------------------------------------------------------
// Filter predicate: which normalized values are accepted per key
// ---------------------------------------------------------------------------

/// Per-key selection state: maps key → set of accepted (normalized) values.
pub type FilterState = BTreeMap<String, BTreeSet<MetadataValue>>;

/// Build a [`FilterState`] that accepts exactly the values of `signature`.
pub fn signature_filter(signature: &Signature) -> FilterState {
    signature
        .0
        .iter()
        .map(|(key, val)| (key.clone(), BTreeSet::from([val.clone()])))
        .collect()
}

/// Return indices of records that pass all filters.
///
/// A record passes a key filter when:
/// * The accepted set for that key is empty → nothing accepted → fails
/// * The record's normalized value for that key is in the accepted set → passes
/// * The record lacks the key → passes only if `Null` is accepted
pub fn filtered_indices(batch: &ImageBatch, filters: &FilterState, decimals: u32) -> Vec<usize> {
    batch
        .records
        .iter()
        .enumerate()
        .filter(|(_, rec)| {
            for (key, accepted) in filters {
                if accepted.is_empty() {
                    return false;
                }
                match rec.metadata.get(key) {
                    Some(val) => {
                        if !accepted.contains(&val.normalized(decimals)) {
                            return false;
                        }
                    }
                    None => {
                        if !accepted.contains(&MetadataValue::Null) {
                            return false;
                        }
                    }
                }
            }
            true
        })
        .map(|(i, _)| i)
        .collect()
}

/// Keys on which the batch holds more than one normalized value, with two of
/// the disagreeing values.
pub fn conflicting_keys(
    batch: &ImageBatch,
    keys: &[String],
    decimals: u32,
) -> Vec<(String, MetadataValue, MetadataValue)> {
    keys.iter()
        .filter_map(|key| {
            let values: BTreeSet<MetadataValue> = batch
                .records
                .iter()
                .map(|rec| {
                    rec.metadata
                        .get(key)
                        .map(|v| v.normalized(decimals))
                        .unwrap_or(MetadataValue::Null)
                })
                .collect();
            let mut iter = values.into_iter();
            match (iter.next(), iter.next()) {
                (Some(a), Some(b)) => Some((key.clone(), a, b)),
                _ => None,
            }
        })
        .collect()
}
