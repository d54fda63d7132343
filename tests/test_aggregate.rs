// Integration tests for output decoding and duplicate suppression.

mod common;

use edgesight::aggregate::{suppress, Annotation, Region, ResultAggregator};
use edgesight::capture::{FrameId, LeaseCounter};
use edgesight::inference::InferenceResult;
use edgesight::DecodeConfig;
use proptest::prelude::*;
use tokio::time::Instant;

fn aggregator(confidence: f32, overlap: f32) -> ResultAggregator {
    let decode = DecodeConfig {
        confidence_threshold: confidence,
        overlap_threshold: overlap,
        ..DecodeConfig::default()
    };
    ResultAggregator::new(common::detector_output(&["person"]), &decode)
}

#[test]
fn single_detection_round_trips_above_threshold() {
    let output = common::rows(&[[0.25, 0.25, 0.5, 0.75, 0.9, 0.0]]);

    let kept = aggregator(0.5, 0.45).decode(&output, 640, 480).unwrap();
    assert_eq!(
        kept,
        vec![Annotation {
            label: "person".into(),
            class_id: 0,
            score: 0.9,
            region: Region::new(160.0, 120.0, 320.0, 360.0),
        }]
    );

    let none = aggregator(0.95, 0.45).decode(&output, 640, 480).unwrap();
    assert!(none.is_empty());
}

#[test]
fn overlapping_detections_collapse_to_the_most_confident() {
    let output = common::rows(&[
        [0.10, 0.10, 0.50, 0.50, 0.6, 0.0],
        [0.12, 0.10, 0.52, 0.50, 0.8, 0.0],
    ]);
    let kept = aggregator(0.5, 0.45).decode(&output, 100, 100).unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].score, 0.8);
}

#[test]
fn suppression_is_deterministic_for_identical_input() {
    let output = common::rows(&[
        [0.0, 0.0, 0.4, 0.4, 0.7, 0.0],
        [0.05, 0.0, 0.45, 0.4, 0.7, 0.0],
        [0.6, 0.6, 0.9, 0.9, 0.55, 1.0],
    ]);
    let agg = aggregator(0.5, 0.45);
    let first = agg.decode(&output, 200, 200).unwrap();
    let second = agg.decode(&output, 200, 200).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    // Unlabelled class ids fall back to a generic name
    assert_eq!(first[1].label, "class-1");
}

#[test]
fn coordinates_outside_the_frame_are_clamped() {
    let output = common::rows(&[[-0.2, 0.5, 1.4, 1.0, 0.9, 0.0]]);
    let kept = aggregator(0.5, 0.45).decode(&output, 10, 10).unwrap();
    assert_eq!(kept[0].region, Region::new(0.0, 5.0, 10.0, 10.0));
}

#[test]
fn attach_pairs_result_with_its_frame() {
    let leases = LeaseCounter::new();
    let frame = common::frame(7, &leases);
    let now = Instant::now();
    let result = InferenceResult {
        frame_id: FrameId(7),
        output: common::rows(&[[0.0, 0.0, 1.0, 1.0, 0.75, 0.0]]),
        started_at: now,
        finished_at: now,
    };

    let annotated = aggregator(0.5, 0.45).attach(result, frame).unwrap();
    assert_eq!(annotated.frame.id(), FrameId(7));
    assert_eq!(annotated.annotations.len(), 1);
    assert_eq!(annotated.annotations[0].region, Region::full(8, 8));

    drop(annotated);
    assert_eq!(leases.outstanding(), 0);
}

fn candidate() -> impl Strategy<Value = Annotation> {
    (0usize..3, 0.0f32..1.0, 0.0f32..90.0, 0.0f32..90.0, 1.0f32..30.0, 1.0f32..30.0).prop_map(
        |(class_id, score, x, y, w, h)| Annotation {
            label: format!("c{class_id}"),
            class_id,
            score,
            region: Region::new(x, y, x + w, y + h),
        },
    )
}

proptest! {
    #[test]
    fn survivors_never_overlap_within_a_class(
        candidates in prop::collection::vec(candidate(), 0..24),
        overlap in 0.1f32..0.9,
    ) {
        let kept = suppress(candidates.clone(), overlap, false);
        prop_assert!(kept.len() <= candidates.len());
        prop_assert!(kept.windows(2).all(|w| w[0].score >= w[1].score));
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                prop_assert!(a.class_id != b.class_id || a.region.iou(&b.region) <= overlap);
            }
        }
        // Same input, same output
        prop_assert_eq!(kept, suppress(candidates, overlap, false));
    }
}
