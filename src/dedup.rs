//! Deduplicator: compacts the candidate records of one file.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::record::CandidateRecord;

/// Keeps the first record for every `(lower-cased name, header)` identity, in input order.
pub fn dedup(records: &[CandidateRecord]) -> Vec<CandidateRecord> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        if seen.insert(record.identity()) {
            out.push(record.clone());
        } else {
            debug!(
                "Dropping duplicate {:?} / {:?}",
                record.name.as_deref().unwrap_or_default(),
                record.header.as_deref().unwrap_or_default()
            );
        }
    }
    out
}

/// Identities that occur more than once, with their counts, in order of first appearance.
pub fn find_collisions(records: &[CandidateRecord]) -> Vec<((String, String), usize)> {
    let mut counts: HashMap<(String, String), usize> = HashMap::new();
    let mut order = Vec::new();
    for record in records {
        let identity = record.identity();
        let count = counts.entry(identity.clone()).or_insert(0);
        if *count == 0 {
            order.push(identity);
        }
        *count += 1;
    }
    order
        .into_iter()
        .filter_map(|identity| {
            let count = counts[&identity];
            (count > 1).then_some((identity, count))
        })
        .collect()
}
