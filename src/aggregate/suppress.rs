//! Greedy duplicate suppression among overlapping regions

use std::cmp::Ordering;

use super::annotation::Annotation;

/// Keep the highest-scoring annotation of every overlapping group.
///
/// Candidates are visited in descending score order, ties in input order, so
/// the outcome depends only on the input sequence. A candidate is discarded
/// when its overlap with an already kept annotation exceeds `overlap`. Unless
/// `class_agnostic`, only annotations of the same class suppress each other.
pub fn suppress(mut candidates: Vec<Annotation>, overlap: f32, class_agnostic: bool) -> Vec<Annotation> {
    // Stable sort keeps input order among equal scores
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<Annotation> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let duplicate = kept.iter().any(|k| {
            (class_agnostic || k.class_id == candidate.class_id)
                && k.region.iou(&candidate.region) > overlap
        });
        if !duplicate {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Region;

    fn ann(class_id: usize, score: f32, x1: f32) -> Annotation {
        Annotation {
            label: format!("c{class_id}"),
            class_id,
            score,
            region: Region::new(x1, 0.0, x1 + 10.0, 10.0),
        }
    }

    #[test]
    fn overlapping_same_class_keeps_highest() {
        let kept = suppress(vec![ann(0, 0.6, 1.0), ann(0, 0.8, 0.0)], 0.45, false);
        assert_eq!(kept, vec![ann(0, 0.8, 0.0)]);
    }

    #[test]
    fn other_classes_survive_unless_agnostic() {
        let input = vec![ann(0, 0.8, 0.0), ann(1, 0.6, 1.0)];
        assert_eq!(suppress(input.clone(), 0.45, false).len(), 2);
        assert_eq!(suppress(input, 0.45, true).len(), 1);
    }

    #[test]
    fn disjoint_regions_are_kept_in_score_order() {
        let kept = suppress(vec![ann(0, 0.5, 0.0), ann(0, 0.9, 50.0)], 0.45, false);
        assert_eq!(kept, vec![ann(0, 0.9, 50.0), ann(0, 0.5, 0.0)]);
    }

    #[test]
    fn ties_resolve_by_input_order() {
        let kept = suppress(vec![ann(0, 0.7, 1.0), ann(0, 0.7, 0.0)], 0.45, false);
        assert_eq!(kept, vec![ann(0, 0.7, 1.0)]);
    }
}
