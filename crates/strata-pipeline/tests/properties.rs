//! Property tests for merge convergence and watermark monotonicity.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use strata_pipeline::conform::{partition_entities, upsert};
use strata_pipeline::conformed::snapshot_hash;
use strata_pipeline::entity::{EncounterAttributes, EntityRecord, ParsedRecord};
use strata_pipeline::progress::Watermark;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

/// Full encounter versions: (key index, minute offset, department index).
fn records() -> impl Strategy<Value = Vec<(u8, u32, u8)>> {
    prop::collection::vec((0u8..4, 0u32..10_000, 0u8..3), 1..40)
}

fn parsed(key: u8, minute: u32, department: u8) -> ParsedRecord {
    let at = base() + Duration::minutes(i64::from(minute));
    ParsedRecord {
        natural_key: format!("E{key}"),
        record: EntityRecord::Encounter(EncounterAttributes {
            patient_id: Some(format!("P{key}")),
            department: Some(["cardiology", "emergency", "oncology"][usize::from(department)].into()),
            admission_time: Some(base()),
            ..EncounterAttributes::default()
        }),
        event_time: at,
        ingested_at: at,
    }
}

fn apply(records: &[(ParsedRecord, u64)]) -> BTreeMap<String, EntityRecord> {
    let mut entities = BTreeMap::new();
    for (record, offset) in records {
        upsert(&mut entities, record, *offset);
    }
    entities
        .into_iter()
        .map(|(key, entity)| (key, entity.attributes))
        .collect()
}

proptest! {
    /// Any arrival order of the same versions converges to the same entities.
    #[test]
    fn upsert_converges_under_reordering(
        raw in records(),
        seed in any::<u64>(),
    ) {
        let versions: Vec<(ParsedRecord, u64)> = raw
            .iter()
            .enumerate()
            .map(|(offset, (k, m, d))| (parsed(*k, *m, *d), offset as u64))
            .collect();

        // Deterministic shuffle from the seed.
        let mut shuffled = versions.clone();
        let mut state = seed;
        for i in (1..shuffled.len()).rev() {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let j = usize::try_from(state >> 33).unwrap() % (i + 1);
            shuffled.swap(i, j);
        }

        prop_assert_eq!(apply(&versions), apply(&shuffled));
    }

    /// Replaying every version a second time changes nothing.
    #[test]
    fn replay_is_idempotent(raw in records()) {
        let versions: Vec<(ParsedRecord, u64)> = raw
            .iter()
            .enumerate()
            .map(|(offset, (k, m, d))| (parsed(*k, *m, *d), offset as u64))
            .collect();
        let mut entities = BTreeMap::new();
        for (record, offset) in &versions {
            upsert(&mut entities, record, *offset);
        }
        let before: Vec<String> = partition_entities(entities.clone())
            .values()
            .map(|e| snapshot_hash(e).unwrap())
            .collect();

        for (record, offset) in &versions {
            prop_assert!(!upsert(&mut entities, record, *offset).is_change());
        }
        let after: Vec<String> = partition_entities(entities)
            .values()
            .map(|e| snapshot_hash(e).unwrap())
            .collect();
        prop_assert_eq!(before, after);
    }

    /// The watermark never moves backwards, whatever is observed.
    #[test]
    fn watermark_is_monotonic(observations in prop::collection::vec(prop::option::of(0i64..100_000), 0..50)) {
        let mut watermark = Watermark::default();
        let mut previous = watermark.max_observed_event_time;
        for observed in observations {
            let observed = observed.map(|m| base() + Duration::minutes(m));
            let moved = watermark.advance(observed);
            let current = watermark.max_observed_event_time;
            prop_assert!(current >= previous);
            prop_assert_eq!(moved, current != previous);
            if let Some(observed) = observed {
                prop_assert!(current >= Some(observed));
            }
            previous = current;
        }
    }
}
