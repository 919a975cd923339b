//! Multi-slice retrieval merge with guaranteed representation.
//!
//! A query runs several retrieval *slices* (for example a metadata-filtered
//! slice and an unfiltered one) and this module combines their hits into
//! one ranked list of at most `k` items. Plain score sorting lets a
//! high-volume slice crowd out a small, precise one; the merge here
//! reserves slots per slice instead.
//!
//! # Algorithm
//!
//! 1. `boosted = raw_score × slice.boost_factor` for every hit.
//! 2. Deduplicate by `item_id`, keeping the occurrence with the highest
//!    boosted score and recording every slice that matched.
//! 3. For each slice in priority order (input order), reserve up to
//!    `min_guaranteed` slots for its best not-yet-selected items.
//! 4. Fill the remaining slots by boosted score (desc), then slice
//!    priority (asc), then `item_id` (asc).
//! 5. Order the selection with the same key.
//!
//! A slice whose retrieval failed or came back empty contributes nothing.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::BackendError;
use crate::models::{RetrievalSlice, ScoredItem};

/// The outcome of running one slice.
#[derive(Debug, Clone)]
pub struct SliceResult<'a> {
    pub slice: &'a RetrievalSlice,
    pub items: Result<Vec<ScoredItem>, BackendError>,
}

impl<'a> SliceResult<'a> {
    pub fn ok(slice: &'a RetrievalSlice, items: Vec<ScoredItem>) -> Self {
        Self {
            slice,
            items: Ok(items),
        }
    }
}

/// One merged result, with attribution for citation and debugging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedItem {
    pub item_id: String,
    /// Boosted score used for ranking.
    pub score: f64,
    pub raw_score: f64,
    /// Slice whose occurrence was kept.
    pub slice_id: String,
    /// Every slice that returned this item, in priority order.
    pub matched_slices: Vec<String>,
    /// True when the item holds one of its slice's guaranteed slots.
    pub reserved: bool,
    pub content_type: String,
    pub metadata: serde_json::Value,
}

struct Candidate<'r> {
    item: &'r ScoredItem,
    boosted: f64,
    priority: usize,
    matched: Vec<usize>,
}

fn rank_order(a: (f64, usize, &str), b: (f64, usize, &str)) -> Ordering {
    b.0.total_cmp(&a.0)
        .then(a.1.cmp(&b.1))
        .then_with(|| a.2.cmp(b.2))
}

/// Merge slice results into at most `k` items. Never fails.
pub fn merge_slices(results: &[SliceResult<'_>], k: usize) -> Vec<MergedItem> {
    if k == 0 {
        return Vec::new();
    }

    let mut candidates: HashMap<&str, Candidate<'_>> = HashMap::new();
    // Per slice: (item_id, boosted score under that slice), best first.
    let mut per_slice: Vec<Vec<(&str, f64)>> = Vec::with_capacity(results.len());

    for (priority, result) in results.iter().enumerate() {
        let items: &[ScoredItem] = match &result.items {
            Ok(items) => items,
            Err(_) => &[],
        };
        let mut ranked: Vec<(&str, f64)> = Vec::with_capacity(items.len());

        for item in items {
            if !item.raw_score.is_finite() {
                continue;
            }
            let boosted = item.raw_score * result.slice.boost_factor;
            ranked.push((item.item_id.as_str(), boosted));

            let cand = candidates
                .entry(item.item_id.as_str())
                .or_insert_with(|| Candidate {
                    item,
                    boosted,
                    priority,
                    matched: Vec::new(),
                });
            if !cand.matched.contains(&priority) {
                cand.matched.push(priority);
            }
            if boosted > cand.boosted {
                cand.item = item;
                cand.boosted = boosted;
                cand.priority = priority;
            }
        }

        ranked.sort_by(|a, b| rank_order((a.1, priority, a.0), (b.1, priority, b.0)));
        per_slice.push(ranked);
    }

    let mut chosen: HashSet<&str> = HashSet::new();
    let mut reserved: HashSet<&str> = HashSet::new();

    for (result, ranked) in results.iter().zip(per_slice.iter()) {
        let mut taken = 0;
        for &(item_id, _) in ranked {
            if taken >= result.slice.min_guaranteed || chosen.len() >= k {
                break;
            }
            if chosen.insert(item_id) {
                reserved.insert(item_id);
                taken += 1;
            }
        }
    }

    let mut rest: Vec<(&str, &Candidate<'_>)> = candidates
        .iter()
        .filter(|(id, _)| !chosen.contains(*id))
        .map(|(id, c)| (*id, c))
        .collect();
    rest.sort_by(|a, b| {
        rank_order(
            (a.1.boosted, a.1.priority, a.0),
            (b.1.boosted, b.1.priority, b.0),
        )
    });
    let open = k.saturating_sub(chosen.len());
    chosen.extend(rest.into_iter().take(open).map(|(id, _)| id));

    let mut merged: Vec<MergedItem> = chosen
        .iter()
        .filter_map(|id| candidates.get(id).map(|c| (*id, c)))
        .map(|(id, c)| MergedItem {
            item_id: id.to_string(),
            score: c.boosted,
            raw_score: c.item.raw_score,
            slice_id: results[c.priority].slice.slice_id.clone(),
            matched_slices: c
                .matched
                .iter()
                .map(|p| results[*p].slice.slice_id.clone())
                .collect(),
            reserved: reserved.contains(id),
            content_type: c.item.content_type.clone(),
            metadata: c.item.metadata.clone(),
        })
        .collect();

    merged.sort_by(|a, b| {
        let pa = slice_priority(results, &a.slice_id);
        let pb = slice_priority(results, &b.slice_id);
        rank_order((a.score, pa, &a.item_id), (b.score, pb, &b.item_id))
    });
    merged
}

fn slice_priority(results: &[SliceResult<'_>], slice_id: &str) -> usize {
    results
        .iter()
        .position(|r| r.slice.slice_id == slice_id)
        .unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, score: f64, slice: &str) -> ScoredItem {
        ScoredItem {
            item_id: id.to_string(),
            raw_score: score,
            slice_id: slice.to_string(),
            content_type: "text/plain".to_string(),
            metadata: json!({}),
        }
    }

    fn ids(merged: &[MergedItem]) -> Vec<&str> {
        merged.iter().map(|m| m.item_id.as_str()).collect()
    }

    #[test]
    fn reserved_slots_beat_higher_raw_scores() {
        let a = RetrievalSlice::filtered("A", "tag = 'x'")
            .with_boost(1.25)
            .with_min_guaranteed(2);
        let b = RetrievalSlice::unfiltered("B");
        let results = vec![
            SliceResult::ok(
                &a,
                vec![item("1", 0.9, "A"), item("2", 0.85, "A"), item("3", 0.5, "A")],
            ),
            SliceResult::ok(
                &b,
                vec![item("4", 0.95, "B"), item("5", 0.92, "B"), item("6", 0.91, "B")],
            ),
        ];

        let merged = merge_slices(&results, 4);
        assert_eq!(ids(&merged), vec!["1", "2", "4", "5"]);
        assert!((merged[0].score - 1.125).abs() < 1e-9);
        assert!((merged[1].score - 1.0625).abs() < 1e-9);
        assert!(merged[0].reserved && merged[1].reserved);
        assert!(!merged[2].reserved);
    }

    #[test]
    fn guarantee_holds_when_boost_cannot_lift_scores() {
        let a = RetrievalSlice::filtered("A", "tag = 'x'").with_min_guaranteed(3);
        let b = RetrievalSlice::unfiltered("B");
        let results = vec![
            SliceResult::ok(
                &a,
                vec![
                    item("a1", 0.1, "A"),
                    item("a2", 0.09, "A"),
                    item("a3", 0.08, "A"),
                    item("a4", 0.07, "A"),
                ],
            ),
            SliceResult::ok(
                &b,
                (0..10)
                    .map(|i| item(&format!("b{}", i), 0.99 - i as f64 * 0.01, "B"))
                    .collect(),
            ),
        ];

        let merged = merge_slices(&results, 5);
        assert_eq!(merged.len(), 5);
        let from_a = merged.iter().filter(|m| m.slice_id == "A").count();
        assert_eq!(from_a, 3);
        assert_eq!(ids(&merged), vec!["b0", "b1", "a1", "a2", "a3"]);
    }

    #[test]
    fn duplicates_keep_best_boosted_occurrence_and_all_slices() {
        let a = RetrievalSlice::filtered("A", "tag = 'x'").with_boost(2.0);
        let b = RetrievalSlice::unfiltered("B");
        let results = vec![
            SliceResult::ok(&a, vec![item("shared", 0.4, "A")]),
            SliceResult::ok(&b, vec![item("shared", 0.7, "B"), item("other", 0.5, "B")]),
        ];

        let merged = merge_slices(&results, 10);
        assert_eq!(merged.len(), 2);
        let shared = &merged[0];
        assert_eq!(shared.item_id, "shared");
        assert_eq!(shared.slice_id, "A");
        assert!((shared.score - 0.8).abs() < 1e-9);
        assert!((shared.raw_score - 0.4).abs() < 1e-9);
        assert_eq!(shared.matched_slices, vec!["A", "B"]);
    }

    #[test]
    fn ties_break_by_priority_then_item_id() {
        let a = RetrievalSlice::unfiltered("A");
        let b = RetrievalSlice::unfiltered("B");
        let results = vec![
            SliceResult::ok(&a, vec![item("z", 0.5, "A")]),
            SliceResult::ok(&b, vec![item("c", 0.5, "B"), item("a", 0.5, "B")]),
        ];
        assert_eq!(ids(&merge_slices(&results, 3)), vec!["z", "a", "c"]);
    }

    #[test]
    fn identical_inputs_give_identical_output() {
        let a = RetrievalSlice::filtered("A", "tag = 'x'").with_min_guaranteed(1);
        let b = RetrievalSlice::unfiltered("B");
        let build = || {
            vec![
                SliceResult::ok(&a, vec![item("x", 0.3, "A"), item("y", 0.3, "A")]),
                SliceResult::ok(
                    &b,
                    vec![item("p", 0.3, "B"), item("q", 0.3, "B"), item("x", 0.3, "B")],
                ),
            ]
        };
        let first = merge_slices(&build(), 3);
        for _ in 0..20 {
            assert_eq!(merge_slices(&build(), 3), first);
        }
    }

    #[test]
    fn failed_and_empty_slices_contribute_nothing() {
        let a = RetrievalSlice::filtered("A", "tag = 'x'").with_min_guaranteed(2);
        let b = RetrievalSlice::unfiltered("B");
        let c = RetrievalSlice::unfiltered("C").with_min_guaranteed(1);
        let results = vec![
            SliceResult {
                slice: &a,
                items: Err(BackendError::Unavailable("timeout".into())),
            },
            SliceResult::ok(&b, vec![item("b1", 0.6, "B")]),
            SliceResult::ok(&c, Vec::new()),
        ];
        let merged = merge_slices(&results, 5);
        assert_eq!(ids(&merged), vec!["b1"]);
    }

    #[test]
    fn everything_empty_or_k_zero_returns_empty() {
        let a = RetrievalSlice::unfiltered("A");
        assert!(merge_slices(&[SliceResult::ok(&a, Vec::new())], 4).is_empty());
        assert!(merge_slices(&[], 4).is_empty());
        assert!(merge_slices(&[SliceResult::ok(&a, vec![item("1", 0.9, "A")])], 0).is_empty());
    }

    #[test]
    fn reservations_never_exceed_k() {
        let a = RetrievalSlice::unfiltered("A").with_min_guaranteed(5);
        let b = RetrievalSlice::unfiltered("B").with_min_guaranteed(5);
        let results = vec![
            SliceResult::ok(
                &a,
                (0..6).map(|i| item(&format!("a{}", i), 0.5, "A")).collect(),
            ),
            SliceResult::ok(
                &b,
                (0..6).map(|i| item(&format!("b{}", i), 0.9, "B")).collect(),
            ),
        ];
        let merged = merge_slices(&results, 3);
        assert_eq!(ids(&merged), vec!["a0", "a1", "a2"]);
    }

    #[test]
    fn non_finite_scores_are_dropped() {
        let a = RetrievalSlice::unfiltered("A");
        let results = vec![SliceResult::ok(
            &a,
            vec![item("nan", f64::NAN, "A"), item("ok", 0.2, "A")],
        )];
        assert_eq!(ids(&merge_slices(&results, 5)), vec!["ok"]);
    }
}
