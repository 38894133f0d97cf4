//! Remote objects exported and invoked across a live router.

mod common;

use async_trait::async_trait;
use common::*;
use futures::future::join_all;
use pamr_codec::{ClassCatalog, ClassDef, CodecError, Object, ObjectDecoder, ObjectEncoder, Value};
use pamr_types::PamrError;
use pamr_wire::agent::AgentBuilder;
use pamr_wire::registry::{agent_uri, object_uri};
use pamr_wire::{AgentClassFetcher, CallContext, RemoteEndpoint, RemoteObject};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use url::Url;

struct EchoObject;

#[async_trait]
impl RemoteObject for EchoObject {
    async fn invoke(&self, _ctx: &CallContext, argument: Value) -> Result<Option<Value>, String> {
        Ok(Some(argument))
    }
}

struct Failing;

#[async_trait]
impl RemoteObject for Failing {
    async fn invoke(&self, _ctx: &CallContext, _argument: Value) -> Result<Option<Value>, String> {
        Err("boom".to_string())
    }
}

/// Reports who called it, returns nothing.
struct Void(tokio::sync::mpsc::UnboundedSender<String>);

#[async_trait]
impl RemoteObject for Void {
    async fn invoke(&self, ctx: &CallContext, _argument: Value) -> Result<Option<Value>, String> {
        let _ = self.0.send(format!("{} {}", ctx.source(), ctx.uri()));
        Ok(None)
    }
}

/// Counts down by calling its peer, which calls back.
struct Ping {
    peer: OnceLock<Url>,
}

#[async_trait]
impl RemoteObject for Ping {
    async fn invoke(&self, ctx: &CallContext, argument: Value) -> Result<Option<Value>, String> {
        let n = argument.as_int().ok_or("expected an integer")?;
        if n == 0 {
            return Ok(Some(Value::Int(0)));
        }
        let peer = self.peer.get().ok_or("peer not set")?;
        let below = ctx
            .endpoint()
            .invoke(peer, Value::Int(n - 1), false)
            .await
            .map_err(|e| e.to_string())?
            .and_then(|v| v.as_int())
            .ok_or("peer returned nothing")?;
        Ok(Some(Value::Int(below + 1)))
    }
}

/// Returns an object of a class only the serving side defines.
struct PointFactory;

#[async_trait]
impl RemoteObject for PointFactory {
    async fn invoke(&self, _ctx: &CallContext, _argument: Value) -> Result<Option<Value>, String> {
        Ok(Some(Value::Object(
            Object::new("geo.Point").with("x", 1i64).with("y", 2i64),
        )))
    }
}

async fn endpoint(router: &pamr_wire::Router) -> RemoteEndpoint {
    RemoteEndpoint::with_builder(AgentBuilder::new(agent_config(router)).backoff(quick_backoff()))
        .await
        .expect("endpoint connects")
}

#[tokio::test]
async fn test_export_lookup_list_unexport() {
    let (router, _h) = start_router().await;
    let server = endpoint(&router).await;
    let client = endpoint(&router).await;

    let echo = server.export("echo", Arc::new(EchoObject)).unwrap();
    let failing = server.export("failing", Arc::new(Failing)).unwrap();
    assert_eq!(echo, object_uri(server.agent_id(), "echo").unwrap());

    assert!(client.lookup(&echo).await.unwrap());
    let missing = object_uri(server.agent_id(), "missing").unwrap();
    assert!(!client.lookup(&missing).await.unwrap());

    let listed = client
        .list(&agent_uri(server.agent_id()).unwrap())
        .await
        .unwrap();
    assert_eq!(listed, vec![echo.clone(), failing]);

    server.unexport(&echo).unwrap();
    assert!(!client.lookup(&echo).await.unwrap());
    assert!(matches!(server.unexport(&echo), Err(PamrError::NotBound(_))));
}

#[tokio::test]
async fn test_duplicate_export_rejected() {
    let (router, _h) = start_router().await;
    let server = endpoint(&router).await;

    server.export("echo", Arc::new(EchoObject)).unwrap();
    assert!(matches!(
        server.export("echo", Arc::new(EchoObject)),
        Err(PamrError::AlreadyBound(_))
    ));
    server.rebind("echo", Arc::new(Failing)).unwrap();
    assert_eq!(server.registry().len(), 1);
}

#[tokio::test]
async fn test_invoke_returns_result() {
    let (router, _h) = start_router().await;
    let server = endpoint(&router).await;
    let client = endpoint(&router).await;
    let echo = server.export("echo", Arc::new(EchoObject)).unwrap();

    let argument = Value::List(vec![Value::Int(7), Value::Str("seven".into())]);
    let result = client.invoke(&echo, argument.clone(), false).await.unwrap();
    assert_eq!(result, Some(argument));
}

#[tokio::test]
async fn test_void_and_one_way_invocations() {
    let (router, _h) = start_router().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let server = endpoint(&router).await;
    let client = endpoint(&router).await;
    let void = server.export("void", Arc::new(Void(tx))).unwrap();

    assert_eq!(client.invoke(&void, Value::Null, false).await.unwrap(), None);
    assert_eq!(client.invoke(&void, Value::Null, true).await.unwrap(), None);

    let expected = format!("{} {}", client.agent_id(), void);
    for _ in 0..2 {
        let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, expected);
    }
}

#[tokio::test]
async fn test_execution_failure_is_reported() {
    let (router, _h) = start_router().await;
    let server = endpoint(&router).await;
    let client = endpoint(&router).await;
    let failing = server.export("failing", Arc::new(Failing)).unwrap();

    let err = client.invoke(&failing, Value::Null, false).await.unwrap_err();
    assert!(matches!(&err, PamrError::Execution(msg) if msg == "boom"), "{err}");
    assert!(!err.is_routing());

    let unbound = object_uri(server.agent_id(), "nothing").unwrap();
    let err = client.invoke(&unbound, Value::Null, false).await.unwrap_err();
    assert!(matches!(&err, PamrError::Execution(msg) if msg.contains("nothing is bound")), "{err}");
}

#[tokio::test]
async fn test_nested_calls_do_not_deadlock() {
    const DEPTH: i64 = 200;

    let (router, _h) = start_router().await;
    let a = endpoint(&router).await;
    let b = endpoint(&router).await;

    let ping_a = Arc::new(Ping { peer: OnceLock::new() });
    let ping_b = Arc::new(Ping { peer: OnceLock::new() });
    let uri_a = a.export("ping", ping_a.clone()).unwrap();
    let uri_b = b.export("ping", ping_b.clone()).unwrap();
    ping_a.peer.set(uri_b.clone()).unwrap();
    ping_b.peer.set(uri_a).unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        a.invoke(&uri_b, Value::Int(DEPTH), false),
    )
    .await
    .expect("nested calls complete")
    .unwrap();
    assert_eq!(result, Some(Value::Int(DEPTH)));

    eventually("dispatch tasks to finish", || {
        a.stats().in_flight() == 0 && b.stats().in_flight() == 0
    })
    .await;
    assert!(a.stats().completed() + b.stats().completed() >= DEPTH as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_each_making_nested_calls() {
    const CALLS: usize = 400;
    let (router, _h) = start_router().await;
    let a = endpoint(&router).await;
    let b = endpoint(&router).await;
    let caller = endpoint(&router).await;

    let ping_a = Arc::new(Ping { peer: OnceLock::new() });
    let ping_b = Arc::new(Ping { peer: OnceLock::new() });
    let uri_a = a.export("ping", ping_a.clone()).unwrap();
    let uri_b = b.export("ping", ping_b.clone()).unwrap();
    ping_a.peer.set(uri_b.clone()).unwrap();
    ping_b.peer.set(uri_a).unwrap();

    // every request reaching b calls a, which calls b again
    let calls = (0..CALLS).map(|_| caller.invoke(&uri_b, Value::Int(2), false));
    let results = tokio::time::timeout(Duration::from_secs(30), join_all(calls))
        .await
        .expect("all nested calls complete");
    assert_eq!(results.len(), CALLS);
    for result in results {
        assert_eq!(result.unwrap(), Some(Value::Int(2)));
    }

    eventually("dispatch tasks to finish", || {
        a.stats().in_flight() == 0 && b.stats().in_flight() == 0
    })
    .await;
    assert_eq!(a.stats().completed() + b.stats().completed(), 3 * CALLS as u64);
}

#[tokio::test]
async fn test_unknown_class_fetched_from_its_origin_once() {
    let (router, _h) = start_router().await;
    let server = endpoint(&router).await;
    let client = endpoint(&router).await;
    server.define_class(ClassDef::new("geo.Point", 1, &["x", "y"]));
    let factory = server.export("points", Arc::new(PointFactory)).unwrap();
    assert!(!client.catalog().contains("geo.Point"));

    let point = client.invoke(&factory, Value::Null, false).await.unwrap().unwrap();
    let point = point.as_object().unwrap();
    assert_eq!(point.class, "geo.Point");
    assert_eq!(point.get("x"), Some(&Value::Int(1)));

    assert!(client.catalog().contains("geo.Point"));
    assert_eq!(
        client.catalog().origin_of("geo.Point"),
        Some(server.origin().unwrap().to_string())
    );

    // one invoke plus one class fetch
    eventually("server tasks to settle", || server.stats().completed() == 2).await;

    client.invoke(&factory, Value::Null, false).await.unwrap().unwrap();
    eventually("second invoke", || server.stats().completed() == 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.stats().completed(), 3);
}

#[tokio::test]
async fn test_class_missing_at_origin_names_the_origin() {
    let (router, _h) = start_router().await;
    let holder = endpoint(&router).await;
    let reader = endpoint(&router).await;

    // A stream claiming `holder` serves the class, which it does not.
    let writer_catalog = Arc::new(ClassCatalog::new());
    writer_catalog.define(ClassDef::new("ghost.Thing", 1, &[]));
    let origin = holder.origin().unwrap();
    let stream = ObjectEncoder::new(writer_catalog, origin.as_str())
        .encode(&Value::Object(Object::new("ghost.Thing")))
        .unwrap();

    let decoder = ObjectDecoder::with_fetcher(
        Arc::clone(reader.catalog()),
        Arc::new(AgentClassFetcher::new(Arc::clone(reader.agent()))),
    );
    match decoder.decode(&stream).await {
        Err(CodecError::ClassNotFound { class, origin: tried, .. }) => {
            assert_eq!(class, "ghost.Thing");
            assert_eq!(tried, origin.to_string());
        }
        other => panic!("expected class not found, got {other:?}"),
    }
    assert!(!reader.catalog().contains("ghost.Thing"));
}
