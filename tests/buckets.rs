//! Bucket lifecycle through the public API: creation, deletion, listing,
//! sequences, and name validation.

use paildb::{Database, Error, Options};

fn open_db(path: &std::path::Path) -> Database {
    Options::new().page_size(4096).open(path).unwrap()
}

#[test]
fn buckets_are_listed_in_lexicographic_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir.path().join("test.db"));

    let mut txn = db.begin_write().unwrap();
    txn.create_bucket("foo").unwrap();
    txn.create_bucket("bar").unwrap();
    txn.create_bucket("baz").unwrap();
    txn.commit().unwrap();

    let txn = db.begin_read().unwrap();
    let buckets = txn.buckets();
    assert_eq!(buckets.len(), 3);
    assert_eq!(buckets[0].name(), "bar");
    assert_eq!(buckets[1].name(), "baz");
    assert_eq!(buckets[2].name(), "foo");
}

#[test]
fn bucket_returns_none_for_missing_names() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir.path().join("test.db"));

    let mut txn = db.begin_write().unwrap();
    txn.create_bucket("rw-widgets").unwrap();
    txn.commit().unwrap();

    let txn = db.begin_read().unwrap();
    assert!(txn.bucket("rw-widgets").is_some());
    assert!(txn.bucket("no_such_bucket").is_none());
}

#[test]
fn create_bucket_rejects_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir.path().join("test.db"));

    let mut txn = db.begin_write().unwrap();
    txn.create_bucket("rw-widgets").unwrap();
    assert!(matches!(
        txn.create_bucket("rw-widgets"),
        Err(Error::BucketExists)
    ));
}

#[test]
fn create_bucket_validates_names() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir.path().join("test.db"));

    let mut txn = db.begin_write().unwrap();
    assert!(matches!(
        txn.create_bucket(""),
        Err(Error::BucketNameRequired)
    ));
    txn.create_bucket(&"X".repeat(255)).unwrap();
    assert!(matches!(
        txn.create_bucket(&"X".repeat(256)),
        Err(Error::BucketNameTooLarge)
    ));
}

#[test]
fn create_bucket_if_not_exists_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir.path().join("test.db"));

    let mut txn = db.begin_write().unwrap();
    txn.create_bucket_if_not_exists("rw-widgets").unwrap();
    txn.create_bucket_if_not_exists("rw-widgets").unwrap();
    txn.commit().unwrap();

    let txn = db.begin_read().unwrap();
    assert!(txn.bucket("rw-widgets").is_some());
}

#[test]
fn delete_bucket_removes_data_and_allows_recreation() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir.path().join("test.db"));

    let mut txn = db.begin_write().unwrap();
    txn.create_bucket("rw-widgets").unwrap();
    txn.put("rw-widgets", b"rw-foo", b"rw-bar").unwrap();

    txn.delete_bucket("rw-widgets").unwrap();
    assert!(matches!(
        txn.get("rw-widgets", b"rw-foo"),
        Err(Error::BucketNotFound)
    ));

    // Recreating must not resurrect the old contents.
    txn.create_bucket("rw-widgets").unwrap();
    assert_eq!(txn.get("rw-widgets", b"rw-foo").unwrap(), None);
    txn.commit().unwrap();

    let txn = db.begin_read().unwrap();
    assert_eq!(txn.get("rw-widgets", b"rw-foo").unwrap(), None);
}

#[test]
fn delete_bucket_survives_commit() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir.path().join("test.db"));

    let mut txn = db.begin_write().unwrap();
    txn.create_bucket("doomed").unwrap();
    txn.put("doomed", b"k", b"v").unwrap();
    txn.create_bucket("kept").unwrap();
    txn.commit().unwrap();

    let mut txn = db.begin_write().unwrap();
    txn.delete_bucket("doomed").unwrap();
    txn.commit().unwrap();

    let txn = db.begin_read().unwrap();
    assert!(txn.bucket("doomed").is_none());
    assert!(matches!(txn.get("doomed", b"k"), Err(Error::BucketNotFound)));
    assert!(txn.bucket("kept").is_some());
}

#[test]
fn delete_missing_bucket_fails() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir.path().join("test.db"));

    let mut txn = db.begin_write().unwrap();
    assert!(matches!(
        txn.delete_bucket("rw-widgets"),
        Err(Error::BucketNotFound)
    ));
}

#[test]
fn next_sequence_increments_per_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir.path().join("test.db"));

    let mut txn = db.begin_write().unwrap();
    txn.create_bucket("rw-widgets").unwrap();
    txn.create_bucket("rw-woojits").unwrap();

    assert_eq!(txn.next_sequence("rw-widgets").unwrap(), 1);
    assert_eq!(txn.next_sequence("rw-widgets").unwrap(), 2);

    // Buckets count independently.
    assert_eq!(txn.next_sequence("rw-woojits").unwrap(), 1);

    assert!(matches!(
        txn.next_sequence("no_such_bucket"),
        Err(Error::BucketNotFound)
    ));
}

#[test]
fn next_sequence_persists_across_commits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    let db = open_db(&path);

    let mut txn = db.begin_write().unwrap();
    txn.create_bucket("rw-widgets").unwrap();
    assert_eq!(txn.next_sequence("rw-widgets").unwrap(), 1);
    txn.commit().unwrap();
    db.close();

    let db = open_db(&path);
    let mut txn = db.begin_write().unwrap();
    assert_eq!(txn.next_sequence("rw-widgets").unwrap(), 2);
}

#[test]
fn rollback_discards_bucket_changes() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir.path().join("test.db"));

    let mut txn = db.begin_write().unwrap();
    txn.create_bucket("kept").unwrap();
    txn.commit().unwrap();

    let mut txn = db.begin_write().unwrap();
    txn.create_bucket("ghost").unwrap();
    txn.delete_bucket("kept").unwrap();
    txn.rollback();

    let txn = db.begin_read().unwrap();
    assert!(txn.bucket("kept").is_some());
    assert!(txn.bucket("ghost").is_none());
}
