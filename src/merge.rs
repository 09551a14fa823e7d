use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::record::{IdentityKey, Record};

/// Collapse records to one per identity key, first occurrence wins.
/// Noise keys (no content and no usable time) are dropped.
pub fn dedupe(records: Vec<Record>) -> Vec<Record> {
    let mut seen: HashSet<IdentityKey> = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|r| {
            let key = r.identity_key();
            !key.is_noise() && seen.insert(key)
        })
        .collect()
}

/// Merge a fresh snapshot into the running record set.
///
/// A truncated record is replaced only by a fresh render that is complete;
/// complete records are never touched. Posts not seen before are appended.
pub fn merge(old: Vec<Record>, fresh: Vec<Record>) -> Vec<Record> {
    if old.is_empty() {
        return dedupe(fresh);
    }
    if fresh.is_empty() {
        return dedupe(old);
    }

    let mut fresh_slots: Vec<Option<Record>> = Vec::with_capacity(fresh.len());
    let mut index: HashMap<IdentityKey, usize> = HashMap::with_capacity(fresh.len());
    for record in fresh {
        let key = record.identity_key();
        if !key.prefix.is_empty() {
            index.entry(key).or_insert(fresh_slots.len());
        }
        fresh_slots.push(Some(record));
    }

    let mut merged = Vec::with_capacity(old.len() + fresh_slots.len());
    let mut replaced = 0usize;

    for old_record in old {
        let key = old_record.identity_key();
        let Some(&slot) = index.get(&key) else {
            merged.push(old_record);
            continue;
        };

        if old_record.is_complete() {
            // Same post, already complete: the fresh copy is redundant.
            fresh_slots[slot] = None;
            merged.push(old_record);
            continue;
        }

        if fresh_slots[slot].as_ref().is_some_and(Record::is_complete) {
            if let Some(candidate) = fresh_slots[slot].take() {
                debug!(
                    from = old_record.content_len(),
                    to = candidate.content_len(),
                    "Replaced truncated post"
                );
                replaced += 1;
                merged.push(candidate);
                continue;
            }
        }
        // Still truncated in the fresh render: keep what we had.
        merged.push(old_record);
    }

    merged.extend(fresh_slots.into_iter().flatten());
    if replaced > 0 {
        debug!(replaced, "Merged fresh snapshot");
    }
    dedupe(merged)
}
