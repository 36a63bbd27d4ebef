//! End-to-end tests against the live mock server.
//!
//! # Design
//! Starts the mock server on a random port in its own thread, then drives
//! resources, collections and records over real HTTP through
//! `UreqTransport`. Catches drift between the payload types in `types` and
//! what the server actually sends.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use swr_core::{
    Collection, CollectionOptions, ErrorKind, LoadOptions, MutationOptions, PatchOperation, Query,
    Record, RecordOptions, RemoveOptions, Resource, ResourceOptions, RetryPolicy, Transport,
    UreqTransport,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Metadata {
    title: String,
    #[serde(default)]
    kind: Option<String>,
}

fn start_server() -> String {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run(listener).await
        })
        .unwrap();
    });

    format!("http://{addr}")
}

fn transport() -> Arc<dyn Transport> {
    Arc::new(UreqTransport::new())
}

async fn wait_until<F>(resource: &Resource<Value>, done: F)
where
    F: Fn(&swr_core::ResourceState<Value>) -> bool,
{
    let mut rx = resource.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| done(s)))
        .await
        .expect("condition not reached in time")
        .unwrap();
}

#[tokio::test]
async fn resource_loads_and_reloads() {
    let base = start_server();
    let r: Resource<Value> = Resource::new(transport(), None, Query::new(), ResourceOptions::default());

    r.load(LoadOptions::url(format!("{base}/api/records/1")));
    let state = r.settled().await;
    assert!(state.error.is_none(), "{:?}", state.error);
    assert_eq!(state.data.as_ref().unwrap()["metadata"]["title"], "Record 1");
    assert!(state.loaded);

    r.reload(Some(true));
    let state = r.settled().await;
    assert_eq!(state.url.as_deref(), Some(&*format!("{base}/api/records/1")));
    assert!(state.loaded);
}

#[tokio::test]
async fn failures_are_classified() {
    let base = start_server();
    let r: Resource<Value> = Resource::new(transport(), None, Query::new(), ResourceOptions::default());

    r.load(LoadOptions::url(format!("{base}/api/status/404")));
    let err = r.settled().await.error.unwrap();
    assert_eq!(err.kind(), ErrorKind::ClientError);
    assert_eq!(err.status(), Some(404));
    assert_eq!(err.reason(), Some(&json!("Not Found")));

    r.load(LoadOptions::url(format!("{base}/api/status/403")));
    assert_eq!(r.settled().await.error.unwrap().kind(), ErrorKind::Unauthorized);

    r.load(LoadOptions::url(format!("{base}/api/status/503")));
    assert_eq!(r.settled().await.error.unwrap().kind(), ErrorKind::ServerError);

    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    r.load(LoadOptions::url(format!("http://{closed}/nothing")));
    assert_eq!(r.settled().await.error.unwrap().kind(), ErrorKind::ResponseMissing);
}

#[tokio::test]
async fn retry_recovers_from_flaky_endpoint() {
    let base = start_server();
    let options = ResourceOptions {
        retry: RetryPolicy::new(2, Duration::from_millis(100)),
        ..ResourceOptions::default()
    };
    let r: Resource<Value> = Resource::new(transport(), None, Query::new(), options);

    r.load(LoadOptions::url(format!("{base}/api/flaky/retry?fail=1")));
    wait_until(&r, |s| s.data.is_some()).await;

    let state = r.state();
    assert!(state.error.is_none());
    assert_eq!(state.data.unwrap()["attempts"], 2);
}

#[tokio::test]
async fn slower_superseded_response_is_dropped() {
    let base = start_server();
    let r: Resource<Value> = Resource::new(transport(), None, Query::new(), ResourceOptions::default());

    let first = r.load_promise(LoadOptions::url(format!("{base}/api/slow?ms=300&tag=a")));
    r.load(LoadOptions::url(format!("{base}/api/slow?ms=0&tag=b")));
    assert!(first.await.is_err());

    assert_eq!(r.settled().await.data.unwrap()["tag"], "b");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(r.data().unwrap()["tag"], "b");
}

#[tokio::test]
async fn collection_paginates_and_facets() {
    let base = start_server();
    let url = format!("{base}/api/records/");
    let c: Collection<Value> = Collection::new(transport(), &url, Query::new(), CollectionOptions::default());

    c.load(LoadOptions::default());
    c.http().settled().await;
    c.http_options().settled().await;

    assert!(c.loaded(), "{:?}", c.http().error());
    assert_eq!(c.records_count(), 35);
    assert_eq!(c.pages(), 4);
    let records = c.records();
    assert_eq!(records.len(), 10);
    assert_eq!(records[0].links["ui"], "/api/records/1");

    let defs = c.facet_definitions();
    assert_eq!(defs["kind"]["label"], "Kind");
    assert_eq!(defs["year"]["order"], 1);
    assert!(c.facets()["kind"]["buckets"].is_array());

    c.set_page(2);
    c.http().settled().await;
    assert_eq!(c.records()[0].id.as_deref(), Some("11"));

    c.set_page(10);
    assert_eq!(c.page(), 4);
    c.http().settled().await;
    assert_eq!(c.records().len(), 5);

    c.load_facets(vec!["year".into()]);
    let facets = c.http_facets().settled().await;
    let page = facets.data.unwrap();
    assert!(page.hits.hits.is_empty());
    assert!(page.aggregations.get("year").is_some());
    assert!(page.aggregations.get("kind").is_none());
}

#[tokio::test]
async fn record_create_patch_delete() {
    let base = start_server();
    let t = transport();

    let creator: Resource<Value> = Resource::new(
        t.clone(),
        Some(&format!("{base}/api/records/")),
        Query::new(),
        ResourceOptions::default(),
    );
    let outcome = creator
        .post(MutationOptions::new(json!({"metadata": {"title": "Created", "kind": "article"}})).replace_content())
        .await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    let location = creator.url().unwrap();
    assert!(location.starts_with(&format!("{base}/api/records/")));
    assert_ne!(location, format!("{base}/api/records/"));
    assert!(!creator.load_enabled());

    let record: Record<Metadata> = Record::new(t.clone(), &location, RecordOptions::default());
    record.http().reload(None);
    record.http().settled().await;
    assert_eq!(record.metadata().unwrap().title, "Created");

    let draft = record.create_model().unwrap();
    draft.update(|m| m.title = "Local edit".into());
    assert_eq!(record.metadata().unwrap().title, "Created");

    let outcome = record
        .http()
        .patch(
            vec![PatchOperation::replace("/metadata/title", json!("Patched"))],
            MutationOptions::new(Value::Null).replace_content(),
        )
        .await;
    assert!(outcome.result.is_ok());
    assert_eq!(record.metadata().unwrap().title, "Patched");
    assert_eq!(draft.get().title, "Patched");
    assert_eq!(record.http().data().unwrap().revision, Some(2));

    let removed = record.http().remove(RemoveOptions::default()).await;
    assert_eq!(removed, Ok(Value::Null));

    record.http().reload(Some(true));
    let state = record.http().settled().await;
    assert_eq!(state.error.unwrap().status(), Some(404));
    assert_eq!(record.metadata().unwrap().title, "Patched");
}
