use kvflood::kvstore::filter::{FilterOperator, KvFilter};
use kvflood::kvstore::record::{compare_content, Record, TTL_INFINITY};
use kvflood::kvstore::store::{MergeOutcome, RecordStore};
use proptest::prelude::*;

const KEY: &str = "adj:node1";

fn record_strategy() -> impl Strategy<Value = Record> {
    (
        1i64..4,
        prop::sample::select(vec!["node1", "node2", "node3"]),
        prop::sample::select(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]),
        prop_oneof![9 => 1i64..10_000, 1 => Just(TTL_INFINITY)],
        0i64..4,
    )
        .prop_map(|(version, originator, value, ttl, ttl_version)| {
            Record::new(version, originator, Some(value), ttl).with_ttl_version(ttl_version)
        })
}

fn merge_all(records: &[Record]) -> RecordStore {
    let mut store = RecordStore::new("0");
    for record in records {
        store.merge(KEY, record.clone());
    }
    store
}

proptest! {
    #[test]
    fn test_merge_is_order_independent(
        records in prop::collection::vec(record_strategy(), 1..12),
        seed in any::<u64>()
    ) {
        let forward = merge_all(&records);

        let mut reversed = records.clone();
        reversed.reverse();
        let backward = merge_all(&reversed);

        let mut rotated = records.clone();
        let shift = (seed as usize) % rotated.len();
        rotated.rotate_left(shift);
        let rotated = merge_all(&rotated);

        prop_assert_eq!(forward.get(KEY), backward.get(KEY));
        prop_assert_eq!(forward.get(KEY), rotated.get(KEY));
    }

    #[test]
    fn test_merge_is_idempotent(records in prop::collection::vec(record_strategy(), 1..12)) {
        let mut store = merge_all(&records);
        let before = store.get(KEY).cloned();
        for record in records.iter() {
            let outcome = store.merge(KEY, record.clone());
            prop_assert!(!outcome.is_accepted());
        }
        prop_assert_eq!(store.get(KEY).cloned(), before);
    }

    #[test]
    fn test_merge_keeps_greatest_content(records in prop::collection::vec(record_strategy(), 1..12)) {
        let store = merge_all(&records);
        let stored = store.get(KEY).unwrap();
        for record in records.iter() {
            prop_assert_ne!(
                compare_content(record, stored),
                std::cmp::Ordering::Greater
            );
        }
    }

    #[test]
    fn test_ttl_only_record_never_creates_a_key(
        version in 1i64..10,
        ttl in 1i64..10_000
    ) {
        let mut store = RecordStore::new("0");
        let refresh = Record::new(version, "node1", None, ttl);
        prop_assert_eq!(store.merge(KEY, refresh), MergeOutcome::Rejected);
        prop_assert!(store.is_empty());
    }

    #[test]
    fn test_prefix_filter_matches_its_own_prefix(
        prefix in "[a-z]{1,6}:",
        suffix in "[a-z0-9]{0,8}"
    ) {
        let filter = KvFilter::with_keys([prefix.clone()]).compile().unwrap();
        let record = Record::new(1, "node1", Some(b"v".to_vec()), 1000);
        let key = format!("{}{}", prefix, suffix);
        prop_assert!(filter.matches(&key, &record));
        let other_key = format!("zz{}", key);
        prop_assert!(!filter.matches(&other_key, &record));
    }

    #[test]
    fn test_and_filter_is_stricter_than_or(
        key in "(adj|prefix):[a-z]{1,4}",
        originator in prop::sample::select(vec!["node1", "node2"])
    ) {
        let or = KvFilter::with_keys(["adj:"]).originators(["node1"]);
        let and = or.clone().oper(FilterOperator::And);
        let or = or.compile().unwrap();
        let and = and.compile().unwrap();
        let record = Record::new(1, originator, Some(b"v".to_vec()), 1000);
        if and.matches(&key, &record) {
            prop_assert!(or.matches(&key, &record));
        }
    }
}
