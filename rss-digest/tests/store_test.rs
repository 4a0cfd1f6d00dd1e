use chrono::{TimeZone, Utc};
use rss_digest::{resolve, ArticleCandidate, DedupStore, MemoryDedupStore, SqliteDedupStore};

const FEED: &str = "https://journal.example/rss";
const OTHER_FEED: &str = "https://other.example/rss";

async fn exercise(store: &dyn DedupStore) {
    let article = resolve(&ArticleCandidate::new(FEED, "A").with_doi("10.1000/abc"));
    let first = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
    let later = Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap();

    assert!(!store.has_seen(FEED, &article).await.unwrap());
    assert_eq!(store.last_seen_at(FEED).await.unwrap(), None);

    store.mark_seen(FEED, &article, first).await.unwrap();
    assert!(store.has_seen(FEED, &article).await.unwrap());

    // Marking again keeps the original timestamp.
    store.mark_seen(FEED, &article, later).await.unwrap();
    let record = store.seen_record(FEED, &article).await.unwrap().unwrap();
    assert_eq!(record.feed_url, FEED);
    assert_eq!(record.identity, article);
    assert_eq!(record.first_seen_at, first);

    // Seen records are kept per feed.
    assert!(!store.has_seen(OTHER_FEED, &article).await.unwrap());

    let second = resolve(&ArticleCandidate::new(FEED, "B").with_guid("b-1"));
    store.mark_seen(FEED, &second, later).await.unwrap();
    assert_eq!(store.last_seen_at(FEED).await.unwrap(), Some(later));
    assert_eq!(store.last_seen_at(OTHER_FEED).await.unwrap(), None);

    assert_eq!(store.get_cache_header(FEED).await.unwrap(), None);
    store
        .set_cache_header(FEED, Some("W/\"abc\""), Some("Tue, 05 Mar 2024 10:00:00 GMT"))
        .await
        .unwrap();
    let header = store.get_cache_header(FEED).await.unwrap().unwrap();
    assert_eq!(header.feed_url, FEED);
    assert_eq!(header.etag.as_deref(), Some("W/\"abc\""));
    assert_eq!(header.last_modified.as_deref(), Some("Tue, 05 Mar 2024 10:00:00 GMT"));

    store.set_cache_header(FEED, None, Some("Wed, 06 Mar 2024 10:00:00 GMT")).await.unwrap();
    let header = store.get_cache_header(FEED).await.unwrap().unwrap();
    assert_eq!(header.etag, None);
    assert_eq!(header.last_modified.as_deref(), Some("Wed, 06 Mar 2024 10:00:00 GMT"));
    assert_eq!(store.get_cache_header(OTHER_FEED).await.unwrap(), None);
}

#[tokio::test]
async fn memory_store_semantics() {
    let store = MemoryDedupStore::new();
    exercise(&store).await;
    assert_eq!(store.seen_count().await, 2);
}

#[tokio::test]
async fn sqlite_store_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteDedupStore::open(dir.path().join("state.db")).await.unwrap();
    exercise(&store).await;
    store.close().await.unwrap();
}

#[tokio::test]
async fn sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state.db");
    let article =
        resolve(&ArticleCandidate::new(FEED, "A").with_link("https://journal.example/a/1"));
    let seen_at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();

    let store = SqliteDedupStore::open(&path).await.unwrap();
    assert_eq!(store.db_path(), path.as_path());
    store.mark_seen(FEED, &article, seen_at).await.unwrap();
    store.set_cache_header(FEED, Some("\"e1\""), None).await.unwrap();
    store.close().await.unwrap();

    let reopened = SqliteDedupStore::open(&path).await.unwrap();
    let record = reopened.seen_record(FEED, &article).await.unwrap().unwrap();
    assert_eq!(record.first_seen_at, seen_at);
    let header = reopened.get_cache_header(FEED).await.unwrap().unwrap();
    assert_eq!(header.etag.as_deref(), Some("\"e1\""));
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn corrupt_database_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    std::fs::write(&path, vec![0xA5u8; 4096]).unwrap();

    let err = SqliteDedupStore::open(&path).await.err().unwrap();
    assert!(err.is_fatal());
}
