//! Round-trip property (`spec.md` §8): replaying the same Added event
//! twice with the same object produces either zero or two identical
//! publishes, never one publish and one silent drop. Exercised against
//! a real local HTTP sink rather than a mock trait, since
//! `EventDispatcher` talks to its sink over `reqwest`.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use kubearchive::dispatcher::EventDispatcher;
use kubearchive::policy::{ApiVersionKind, PolicyRule};

#[derive(Clone, Default)]
struct Sink {
    received: Arc<Mutex<Vec<serde_json::Value>>>,
}

async fn record(State(sink): State<Sink>, Json(event): Json<serde_json::Value>) -> &'static str {
    sink.received.lock().unwrap().push(event);
    "ok"
}

async fn spawn_sink() -> (String, Sink) {
    let sink = Sink::default();
    let app = Router::new().route("/", post(record)).with_state(sink.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/"), sink)
}

#[tokio::test]
async fn replaying_the_same_added_event_never_produces_a_partial_publish() {
    let (url, sink) = spawn_sink().await;
    let dispatcher = EventDispatcher::new(url);

    let avk = ApiVersionKind::new("v1", "Pod");
    let rule = PolicyRule {
        selector: avk.clone(),
        archive_when: "status.phase == 'Failed'".to_string(),
        delete_when: String::new(),
        archive_on_delete: String::new(),
        keep_last: None,
    };
    let object = serde_json::json!({ "status": { "phase": "Failed" } });

    dispatcher.dispatch_upsert(&avk, Some("ns"), "my-pod", &object, &[], std::slice::from_ref(&rule)).await;
    dispatcher.dispatch_upsert(&avk, Some("ns"), "my-pod", &object, &[], std::slice::from_ref(&rule)).await;

    // Give the sink's task a moment to process both requests.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let received = sink.received.lock().unwrap();
    assert!(received.len() == 0 || received.len() == 2, "expected 0 or 2 publishes, got {}", received.len());
    if received.len() == 2 {
        assert_eq!(received[0], received[1]);
    }
}
