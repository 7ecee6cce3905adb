//! Merging of ephemeral contributions.
//!
//! The value of an ephemeral property is the merge of the values of all its
//! children. Child enumeration order is not defined, so merges must give
//! the same result in any order.

use std::collections::{BTreeMap, BTreeSet};

/// Combines ephemeral contributions into one property value.
pub trait Merger<T>: Send + Sync {
    /// Fold `incoming` into `existing`.
    fn merge(&self, existing: T, incoming: &T) -> T;

    /// Name of the child holding `contribution`, if any.
    fn unmerge(&self, contribution: &T, children: &BTreeMap<String, T>) -> Option<String>;
}

/// Merge every child value onto `empty`.
pub fn merge_children<'a, T: 'a>(
    merger: &dyn Merger<T>,
    empty: T,
    children: impl IntoIterator<Item = &'a T>,
) -> T {
    children
        .into_iter()
        .fold(empty, |acc, value| merger.merge(acc, value))
}

/// First child whose value equals `contribution`.
pub fn child_holding<T: PartialEq>(contribution: &T, children: &BTreeMap<String, T>) -> Option<String> {
    children
        .iter()
        .find(|(_, value)| *value == contribution)
        .map(|(name, _)| name.clone())
}

/// Union of string sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetUnionMerger;

impl Merger<BTreeSet<String>> for SetUnionMerger {
    fn merge(&self, mut existing: BTreeSet<String>, incoming: &BTreeSet<String>) -> BTreeSet<String> {
        existing.extend(incoming.iter().cloned());
        existing
    }

    fn unmerge(
        &self,
        contribution: &BTreeSet<String>,
        children: &BTreeMap<String, BTreeSet<String>>,
    ) -> Option<String> {
        child_holding(contribution, children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_union_is_order_independent() {
        let values = vec![set(&["a"]), set(&["b", "c"]), set(&["a", "d"])];
        let forward = merge_children(&SetUnionMerger, BTreeSet::new(), values.iter());
        let backward = merge_children(&SetUnionMerger, BTreeSet::new(), values.iter().rev());
        assert_eq!(forward, set(&["a", "b", "c", "d"]));
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_empty_merge() {
        let merged = merge_children(&SetUnionMerger, BTreeSet::new(), std::iter::empty());
        assert!(merged.is_empty());
    }

    #[test]
    fn test_unmerge_picks_matching_child() {
        let mut children = BTreeMap::new();
        children.insert("ephemeral-0000000000".to_string(), set(&["a"]));
        children.insert("ephemeral-0000000001".to_string(), set(&["b"]));

        assert_eq!(
            SetUnionMerger.unmerge(&set(&["b"]), &children),
            Some("ephemeral-0000000001".to_string())
        );
        assert_eq!(SetUnionMerger.unmerge(&set(&["z"]), &children), None);
    }
}
