// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn cache(capacity: usize) -> DedupCache {
    DedupCache::new(capacity, Duration::from_secs(300))
}

#[test]
fn miss_then_hit() {
    let cache = cache(16);
    assert!(!cache.contains("sdk_a"));
    cache.insert("sdk_a");
    assert!(cache.contains("sdk_a"));
}

#[test]
fn preseed_behaves_like_insert() {
    let cache = cache(16);
    cache.preseed("sdk_echo");
    assert!(cache.contains("sdk_echo"));
    assert_eq!(cache.len(), 1);
}

#[test]
fn reinsert_does_not_grow() {
    let cache = cache(16);
    cache.insert("sdk_a");
    cache.insert("sdk_a");
    assert_eq!(cache.len(), 1);
}

#[test]
fn evicts_least_recently_used_at_capacity() {
    let cache = cache(3);
    cache.insert("a");
    cache.insert("b");
    cache.insert("c");

    // Touch "a" so "b" becomes the LRU entry.
    assert!(cache.contains("a"));

    cache.insert("d");
    assert!(cache.contains("a"));
    assert!(!cache.contains("b"));
    assert!(cache.contains("c"));
    assert!(cache.contains("d"));
}

#[test]
fn ttl_expiry_reports_miss() {
    let cache = DedupCache::new(16, Duration::ZERO);
    cache.insert("short_lived");
    std::thread::sleep(Duration::from_millis(5));
    assert!(!cache.contains("short_lived"));
    assert!(cache.is_empty());
}

#[test]
fn capacity_floor_is_one() {
    let cache = DedupCache::new(0, Duration::from_secs(300));
    cache.insert("only");
    assert!(cache.contains("only"));
    cache.insert("next");
    assert!(!cache.contains("only"));
    assert!(cache.contains("next"));
}

proptest::proptest! {
    /// Inserting N distinct ids never exceeds the capacity bound.
    #[test]
    fn size_stays_bounded(ids in proptest::collection::vec("[a-z]{1,8}", 1..200)) {
        let cache = DedupCache::new(32, Duration::from_secs(300));
        for id in &ids {
            cache.insert(id);
        }
        proptest::prop_assert!(cache.len() <= 32);

        // The most recently inserted id is always retained.
        if let Some(last) = ids.last() {
            proptest::prop_assert!(cache.contains(last));
        }
    }
}
