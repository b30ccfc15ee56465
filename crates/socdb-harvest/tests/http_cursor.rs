//! Integration tests for `HttpCursorEndpoint` behind a `CursorSource`.
//!
//! Each test stands up a local `wiremock` server, so no real network
//! traffic is made. Covers page decoding, cursor following through a full
//! harvest, reply threads under comments, and how each HTTP failure is
//! classified.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use socdb_core::{CanonicalKey, CollectionType, EndpointConfig, FieldMap};
use socdb_harvest::{
    run_harvest, ContinuationToken, CursorSource, GovernorConfig, HarvestOptions, HarvestState,
    HarvestStatus, HarvestTarget, HttpCursorEndpoint, MemoryStore, PageSource, SourceError,
};

fn endpoint_config(server: &MockServer) -> EndpointConfig {
    EndpointConfig {
        url: format!("{}/v1/{{target}}/{{collection}}", server.uri()),
        cursor_param: "cursor".to_owned(),
        query: BTreeMap::from([("count".to_owned(), "2".to_owned())]),
        headers: BTreeMap::from([("x-client".to_owned(), "socdb-test".to_owned())]),
        items_pointer: "/data/items".to_owned(),
        cursor_pointer: Some("/data/cursor".to_owned()),
        has_more_pointer: Some("/data/has_more".to_owned()),
        fields: FieldMap {
            external_id: Some("/id".to_owned()),
            url: Some("/share_url".to_owned()),
            author: Some("/author/handle".to_owned()),
            text: Some("/desc".to_owned()),
            published_at: Some("/create_time".to_owned()),
            likes: Some("/stats/likes".to_owned()),
            views: Some("/stats/plays".to_owned()),
            ..FieldMap::default()
        },
        replies: None,
    }
}

fn source(server: &MockServer) -> CursorSource<HttpCursorEndpoint> {
    let endpoint = HttpCursorEndpoint::new(
        &endpoint_config(server),
        "creator_1",
        CollectionType::Posts,
        5,
        "socdb-test/0.1",
    )
    .expect("failed to build test endpoint");
    CursorSource::new(endpoint)
}

fn page(ids: &[&str], cursor: Option<&str>, has_more: bool) -> serde_json::Value {
    let items: Vec<_> = ids
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "share_url": format!("https://www.tiktok.com/@creator_1/video/{id}?lang=en"),
                "author": { "handle": "creator_1" },
                "desc": format!("clip {id} #socdb"),
                "create_time": 1_700_000_000,
                "stats": { "likes": "1.2K", "plays": 4000 }
            })
        })
        .collect();
    json!({ "data": { "items": items, "cursor": cursor, "has_more": has_more } })
}

fn fast_options() -> HarvestOptions {
    HarvestOptions {
        governor: GovernorConfig {
            min_call_spacing: Duration::ZERO,
            backoff_base: Duration::ZERO,
            max_attempts: 3,
            ..GovernorConfig::default()
        },
        ..HarvestOptions::default()
    }
}

#[tokio::test]
async fn first_page_decodes_items_and_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/creator_1/posts"))
        .and(query_param("count", "2"))
        .and(header("x-client", "socdb-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["101", "102"], Some("abc"), true)))
        .mount(&server)
        .await;

    let batch = source(&server).fetch(None).await.unwrap();

    assert_eq!(batch.items.len(), 2);
    assert_eq!(batch.next, Some(ContinuationToken::cursor("abc")));
    assert!(!batch.complete);

    let first = &batch.items[0];
    assert_eq!(first.external_id.as_deref(), Some("101"));
    assert_eq!(first.author.as_deref(), Some("creator_1"));
    assert_eq!(first.ordinal, Some(0));
    assert_eq!(first.counts.likes.as_ref().and_then(|c| c.value()), Some(1_200));
    assert_eq!(first.counts.views.as_ref().and_then(|c| c.value()), Some(4_000));
    assert_eq!(
        first.published_at.map(|t| t.timestamp()),
        Some(1_700_000_000)
    );
}

#[tokio::test]
async fn harvest_follows_cursor_to_the_last_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/creator_1/posts"))
        .and(query_param("cursor", "abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["103"], None, false)))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/creator_1/posts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["101", "102"], Some("abc"), true)))
        .with_priority(5)
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let (tx, rx) = watch::channel(HarvestStatus::default());
    let state = run_harvest(
        &HarvestTarget::new("creator_1", "tiktok", CollectionType::Posts),
        &store,
        &source(&server),
        &fast_options(),
        &CancellationToken::new(),
        &tx,
    )
    .await
    .unwrap();

    assert_eq!(state, HarvestState::Done);
    assert_eq!(rx.borrow().items_accepted, 3);
    let posts = store.posts();
    assert_eq!(posts.len(), 3);
    assert_eq!(
        posts[0].canonical_url.as_deref(),
        Some("https://www.tiktok.com/@creator_1/video/101")
    );
    assert_eq!(posts[0].hashtags, vec!["socdb"]);
}

fn comment_fields() -> FieldMap {
    FieldMap {
        external_id: Some("/cid".to_owned()),
        author: Some("/user/unique_id".to_owned()),
        text: Some("/text".to_owned()),
        parent_id: Some("/reply_id".to_owned()),
        published_at: Some("/create_time".to_owned()),
        likes: Some("/digg_count".to_owned()),
        comments: Some("/reply_comment_total".to_owned()),
        ..FieldMap::default()
    }
}

fn comments_config(server: &MockServer) -> EndpointConfig {
    let replies = EndpointConfig {
        url: format!("{}/v1/comments/reply", server.uri()),
        cursor_param: "cursor".to_owned(),
        query: BTreeMap::from([
            ("comment_id".to_owned(), "{parent}".to_owned()),
            ("item_id".to_owned(), "7301".to_owned()),
            ("count".to_owned(), "2".to_owned()),
        ]),
        headers: BTreeMap::new(),
        items_pointer: "/comments".to_owned(),
        cursor_pointer: Some("/cursor".to_owned()),
        has_more_pointer: Some("/has_more".to_owned()),
        fields: comment_fields(),
        replies: None,
    };
    EndpointConfig {
        url: format!("{}/v1/comments", server.uri()),
        cursor_param: "cursor".to_owned(),
        query: BTreeMap::from([("aweme_id".to_owned(), "7301".to_owned())]),
        headers: BTreeMap::new(),
        items_pointer: "/comments".to_owned(),
        cursor_pointer: Some("/cursor".to_owned()),
        has_more_pointer: Some("/has_more".to_owned()),
        fields: comment_fields(),
        replies: Some(Box::new(replies)),
    }
}

fn comment_json(cid: &str, reply_to: Option<&str>, replies: i64) -> serde_json::Value {
    json!({
        "cid": cid,
        "user": { "unique_id": "fan_1" },
        "text": format!("comment {cid}"),
        "reply_id": reply_to.unwrap_or("0"),
        "create_time": 1_700_000_100,
        "digg_count": 3,
        "reply_comment_total": replies
    })
}

#[tokio::test]
async fn comment_reply_threads_are_fetched_per_parent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/creator_1/posts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["7301"], None, false)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/comments"))
        .and(query_param("aweme_id", "7301"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "comments": [comment_json("c1", None, 3), comment_json("c2", None, 0)],
            "cursor": 2,
            "has_more": 0
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/comments/reply"))
        .and(query_param("comment_id", "c1"))
        .and(query_param("cursor", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "comments": [comment_json("r3", Some("c1"), 0)],
            "cursor": 3,
            "has_more": 0
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/comments/reply"))
        .and(query_param("comment_id", "c1"))
        .and(query_param("item_id", "7301"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "comments": [comment_json("r1", Some("c1"), 0), comment_json("r2", Some("c1"), 0)],
            "cursor": 2,
            "has_more": 1
        })))
        .with_priority(5)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/comments/reply"))
        .and(query_param("comment_id", "c2"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let (tx, _rx) = watch::channel(HarvestStatus::default());
    run_harvest(
        &HarvestTarget::new("creator_1", "tiktok", CollectionType::Posts),
        &store,
        &source(&server),
        &fast_options(),
        &CancellationToken::new(),
        &tx,
    )
    .await
    .unwrap();

    let comments = CursorSource::new(HttpCursorEndpoint::with_client(
        reqwest::Client::new(),
        &comments_config(&server),
        "7301",
        CollectionType::Comments,
    ));
    let (tx, rx) = watch::channel(HarvestStatus::default());
    let state = run_harvest(
        &HarvestTarget::new("7301", "tiktok", CollectionType::Comments),
        &store,
        &comments,
        &fast_options(),
        &CancellationToken::new(),
        &tx,
    )
    .await
    .unwrap();

    assert_eq!(state, HarvestState::Done);
    let status = rx.borrow().clone();
    assert_eq!(status.items_accepted, 5);
    assert_eq!(status.iterations, 1);
    assert_eq!(status.dropped, 0);

    let stored = store.comments();
    assert_eq!(stored.len(), 5);
    for reply in ["r1", "r2", "r3"] {
        let row = stored
            .iter()
            .find(|c| c.external_comment_id.as_deref() == Some(reply))
            .unwrap();
        assert_eq!(
            row.parent_key,
            Some(CanonicalKey::external_id("c1")),
            "{reply}"
        );
    }
    let top = stored
        .iter()
        .find(|c| c.external_comment_id.as_deref() == Some("c1"))
        .unwrap();
    assert_eq!(top.parent_key, None);
    assert_eq!(top.reply_count, Some(3));
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .mount(&server)
        .await;

    let err = source(&server).fetch(None).await.unwrap_err();
    assert!(
        matches!(
            err,
            SourceError::RateLimited {
                retry_after_secs: Some(7)
            }
        ),
        "expected RateLimited with hint, got: {err:?}"
    );
    assert!(err.is_retriable());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn unauthorized_is_authentication_expired() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = source(&server).fetch(None).await.unwrap_err();
    assert!(matches!(err, SourceError::AuthenticationExpired(_)), "got: {err:?}");
    assert!(!err.is_retriable());
}

#[tokio::test]
async fn not_found_is_rejected_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let (tx, rx) = watch::channel(HarvestStatus::default());
    let result = run_harvest(
        &HarvestTarget::new("creator_1", "tiktok", CollectionType::Posts),
        &store,
        &source(&server),
        &fast_options(),
        &CancellationToken::new(),
        &tx,
    )
    .await;

    assert!(matches!(
        result,
        Err(socdb_harvest::HarvestError::Source(SourceError::Rejected { status: 404, .. }))
    ));
    assert_eq!(rx.borrow().state, HarvestState::Errored);
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["101"], None, false)))
        .with_priority(5)
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let (tx, rx) = watch::channel(HarvestStatus::default());
    let state = run_harvest(
        &HarvestTarget::new("creator_1", "tiktok", CollectionType::Posts),
        &store,
        &source(&server),
        &fast_options(),
        &CancellationToken::new(),
        &tx,
    )
    .await
    .unwrap();

    assert_eq!(state, HarvestState::Done);
    let status = rx.borrow().clone();
    assert_eq!(status.items_accepted, 1);
    assert_eq!(status.items_rejected, 0);
}

#[tokio::test]
async fn malformed_body_is_a_deserialize_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&server)
        .await;

    let err = source(&server).fetch(None).await.unwrap_err();
    assert!(matches!(err, SourceError::Deserialize { .. }), "got: {err:?}");
}

#[tokio::test]
async fn missing_items_array_is_an_empty_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
        .mount(&server)
        .await;

    let batch = source(&server).fetch(None).await.unwrap();
    assert!(batch.items.is_empty());
    assert!(batch.complete, "no has_more flag reads as false");
    assert_eq!(batch.next, None);
}
