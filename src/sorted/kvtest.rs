//! Conformance checks shared by every KeyValue implementation's tests.

use super::{is_not_found, KeyValue, SortedError, MAX_KEY_SIZE, MAX_VALUE_SIZE};

pub fn test_sorted(kv: &dyn KeyValue) {
    assert!(is_empty(kv), "kv for test is expected to be initially empty");

    set(kv, "foo", "bar");
    assert!(
        !is_empty(kv),
        "iterator reports the kv is empty after adding foo=bar; iterator must be broken"
    );
    assert_eq!(kv.get("foo").unwrap(), "bar");

    let err = kv.get("NOT_EXIST").unwrap_err();
    assert!(is_not_found(&err), "get(NOT_EXIST) = {err}; want not found");

    for i in 0..2 {
        if let Err(e) = kv.delete("foo") {
            panic!("Delete(foo) (on loop {}/2) returned error {e}", i + 1);
        }
    }
    assert!(is_not_found(&kv.get("foo").unwrap_err()));

    set(kv, "a", "av");
    set(kv, "b", "bv");
    set(kv, "c", "cv");
    test_enumerate(kv, "", "", &["av", "bv", "cv"]);
    test_enumerate(kv, "a", "", &["av", "bv", "cv"]);
    test_enumerate(kv, "b", "", &["bv", "cv"]);
    test_enumerate(kv, "a", "c", &["av", "bv"]);
    test_enumerate(kv, "a", "b", &["av"]);
    test_enumerate(kv, "a", "a", &[]);
    test_enumerate(kv, "d", "", &[]);
    test_enumerate(kv, "d", "e", &[]);

    // '|' sorts below '}' byte-wise; collations other than C get this wrong.
    set(kv, "foo|abc", "foo|abcv");
    test_enumerate(kv, "foo|", "", &["foo|abcv"]);
    test_enumerate(kv, "foo|", "foo}", &["foo|abcv"]);

    // the value must not be used instead of the key in range comparisons
    set(kv, "y", "x:foo");
    test_enumerate(kv, "x:", "x~", &[]);

    test_insert_large(kv);
    test_insert_too_large(kv);
}

pub fn test_batches(kv: &dyn KeyValue) {
    kv.set("gone", "gonev").unwrap();

    let mut b = kv.begin_batch();
    b.set("b1", "b1v");
    b.set("b2", "b2v");
    b.delete("gone");
    b.set("b3", "b3v");
    assert!(is_not_found(&kv.get("b1").unwrap_err()), "batch visible before commit");
    kv.commit_batch(b).unwrap();

    assert_eq!(kv.get("b1").unwrap(), "b1v");
    assert_eq!(kv.get("b3").unwrap(), "b3v");
    assert!(is_not_found(&kv.get("gone").unwrap_err()));

    // an oversized entry poisons the whole batch
    let mut b = kv.begin_batch();
    b.set("b4", "b4v");
    b.set(&"k".repeat(MAX_KEY_SIZE + 1), "v");
    b.set("b5", "b5v");
    let err = kv.commit_batch(b).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SortedError>(),
        Some(SortedError::KeyTooLarge)
    ));
    assert!(is_not_found(&kv.get("b4").unwrap_err()));
    assert!(is_not_found(&kv.get("b5").unwrap_err()));

    // later mutations of the same key win
    let mut b = kv.begin_batch();
    b.set("dup", "first");
    b.set("dup", "second");
    kv.commit_batch(b).unwrap();
    assert_eq!(kv.get("dup").unwrap(), "second");
}

fn set(kv: &dyn KeyValue, k: &str, v: &str) {
    if let Err(e) = kv.set(k, v) {
        panic!("Error setting {k:?} to {v:?}: {e}");
    }
}

fn test_insert_large(kv: &dyn KeyValue) {
    let mut large_key = "A".repeat(MAX_KEY_SIZE - 2);
    large_key.push('B');
    let mut large_value = "A".repeat(MAX_VALUE_SIZE - 2);
    large_value.push('B');

    set(kv, &large_key, "whatever");
    // the key must come back untruncated
    let mut it = kv.find(&large_key, "");
    assert!(it.next());
    assert_eq!(it.key(), large_key);
    assert_eq!(it.value(), "whatever");
    it.close().unwrap();

    set(kv, "whatever", &large_value);
    assert_eq!(kv.get("whatever").unwrap(), large_value);

    set(kv, &large_key, &large_value);
    let mut it = kv.find(&large_key, "");
    assert!(it.next());
    assert_eq!(it.key(), large_key);
    assert_eq!(it.value(), large_value);
    it.close().unwrap();
}

fn test_insert_too_large(kv: &dyn KeyValue) {
    let large_key = "k".repeat(MAX_KEY_SIZE + 1);
    let large_value = "v".repeat(MAX_VALUE_SIZE + 1);

    let err = kv.set(&large_key, "whatever").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SortedError>(),
        Some(SortedError::KeyTooLarge)
    ));
    let err = kv.set("whatever", &large_value).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SortedError>(),
        Some(SortedError::ValueTooLarge)
    ));
}

fn test_enumerate(kv: &dyn KeyValue, start: &str, end: &str, want: &[&str]) {
    let mut got = vec![];
    let mut it = kv.find(start, end);
    let mut last_key: Option<String> = None;
    while it.next() {
        let (key, val) = (it.key().to_owned(), it.value().to_owned());
        assert_eq!(key.as_bytes(), it.key_bytes(), "Key and KeyBytes disagree");
        assert_eq!(val.as_bytes(), it.value_bytes(), "Value and ValueBytes disagree");
        assert_eq!(
            format!("{key}v"),
            val,
            "iterator returned unexpected pair for test: {key:?}, {val:?}"
        );
        assert!(key.as_str() >= start);
        assert!(end.is_empty() || key.as_str() < end);
        if let Some(last) = &last_key {
            assert!(last < &key, "keys out of order: {last:?} then {key:?}");
        }
        last_key = Some(key);
        got.push(val);
    }
    if let Err(e) = it.close() {
        panic!("for enumerate of ({start:?}, {end:?}), Close error: {e}");
    }
    assert_eq!(got, want, "for enumerate of ({start:?}, {end:?})");
}

fn is_empty(kv: &dyn KeyValue) -> bool {
    let mut it = kv.find("", "");
    let has_row = it.next();
    if let Err(e) = it.close() {
        panic!("Error closing iterator while testing for emptiness: {e}");
    }
    !has_row
}
