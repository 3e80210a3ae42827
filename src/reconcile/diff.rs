//! Set arithmetic behind the new/terminated classification.

use std::collections::BTreeSet;

/// Ids active in the store but absent from the fresh snapshot, sorted.
///
/// Only absence matters; the provider-reported state of present ids is not
/// consulted.
#[must_use]
pub fn terminated_ids<'a, A, P>(active: A, present: P) -> Vec<String>
where
    A: IntoIterator<Item = &'a String>,
    P: IntoIterator<Item = &'a String>,
{
    let seen: BTreeSet<&String> = present.into_iter().collect();
    active
        .into_iter()
        .filter(|id| !seen.contains(id))
        .cloned()
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

/// Snapshot ids for which `exists` reports no active row, in input order.
///
/// # Errors
///
/// Propagates the first error returned by `exists`.
pub fn new_ids<'a, I, E>(
    snapshot: I,
    mut exists: impl FnMut(&str) -> Result<bool, E>,
) -> Result<Vec<String>, E>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut fresh = Vec::new();
    for id in snapshot {
        if !exists(id)? {
            fresh.push(id.clone());
        }
    }
    Ok(fresh)
}
