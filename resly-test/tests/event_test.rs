//! Event emission, apply hooks, and listeners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use resly_core::{delete_action, Error, Handler, Service};
use resly_test::TestFixture;

fn model_handler() -> Handler {
    Handler::new().model().get_model(|r| {
        r.model(json!({"a": 1}));
        Ok(())
    })
}

#[tokio::test]
async fn change_event_payload() {
    let service = Service::new("notes");
    service.handle("model", model_handler());
    let fx = TestFixture::start(service).await;

    fx.service
        .with("notes.model", |r| {
            r.change_event(HashMap::from([
                ("a".to_string(), json!(2)),
                ("gone".to_string(), delete_action()),
            ]))
            .unwrap();
        })
        .unwrap();

    let ev = fx.conn.next_published().await;
    assert_eq!(ev.subject, "event.notes.model.change");
    let payload: Value = serde_json::from_slice(&ev.payload).unwrap();
    assert_eq!(
        payload,
        json!({"values": {"a": 2, "gone": {"action": "delete"}}})
    );
    fx.shutdown().await;
}

#[tokio::test]
async fn add_and_remove_event_payloads() {
    let service = Service::new("notes");
    service.handle(
        "list",
        Handler::new().collection().get_collection(|r| {
            r.collection(json!(["a"]));
            Ok(())
        }),
    );
    let fx = TestFixture::start(service).await;

    fx.service
        .with("notes.list", |r| {
            r.add_event(json!("b"), 1).unwrap();
            r.remove_event(0).unwrap();
        })
        .unwrap();

    let add = fx.conn.next_published().await;
    assert_eq!(add.subject, "event.notes.list.add");
    assert_eq!(
        serde_json::from_slice::<Value>(&add.payload).unwrap(),
        json!({"value": "b", "idx": 1})
    );
    let remove = fx.conn.next_published().await;
    assert_eq!(remove.subject, "event.notes.list.remove");
    assert_eq!(
        serde_json::from_slice::<Value>(&remove.payload).unwrap(),
        json!({"idx": 0})
    );
    fx.shutdown().await;
}

#[tokio::test]
async fn apply_change_reverse_reaches_listeners() {
    let service = Service::new("notes");
    let seen: Arc<Mutex<Vec<(String, Option<HashMap<String, Value>>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let listener_seen = seen.clone();
    service.handle(
        "model",
        model_handler().apply_change(|_r, changes| {
            // Record the prior value for every changed key.
            let mut reverse = HashMap::new();
            for key in changes.keys() {
                reverse.insert(key.clone(), json!("old"));
            }
            Ok(reverse)
        }),
    );
    service.add_listener("model", move |ev| {
        listener_seen
            .lock()
            .unwrap()
            .push((ev.name.clone(), ev.old_values.clone()));
    });
    let fx = TestFixture::start(service).await;

    fx.service
        .with("notes.model", |r| {
            r.change_event(HashMap::from([("a".to_string(), json!(2))]))
                .unwrap();
        })
        .unwrap();

    let ev = fx.conn.next_published().await;
    assert_eq!(ev.subject, "event.notes.model.change");
    // Listener ran synchronously on the same worker, after the publish.
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "change");
    assert_eq!(
        seen[0].1,
        Some(HashMap::from([("a".to_string(), json!("old"))]))
    );
    fx.shutdown().await;
}

#[tokio::test]
async fn apply_hook_error_suppresses_event() {
    let service = Service::new("notes");
    let (err_tx, mut err_rx) = tokio::sync::mpsc::unbounded_channel();
    service.handle(
        "model",
        model_handler().apply_change(|_r, _changes| Err(Error::new("store.fail", "Store failed"))),
    );
    let fx = TestFixture::start(service).await;

    fx.service
        .with("notes.model", move |r| {
            let err = r
                .change_event(HashMap::from([("a".to_string(), json!(2))]))
                .unwrap_err();
            let _ = err_tx.send(err);
        })
        .unwrap();

    let err = err_rx.recv().await.unwrap();
    assert_eq!(err.code, "store.fail");
    assert!(fx
        .conn
        .try_next_published(Duration::from_millis(50))
        .await
        .is_none());
    fx.shutdown().await;
}

#[tokio::test]
async fn apply_remove_value_reaches_listeners() {
    let service = Service::new("notes");
    let seen: Arc<Mutex<Vec<Option<Value>>>> = Arc::new(Mutex::new(Vec::new()));
    let listener_seen = seen.clone();
    service.handle(
        "list",
        Handler::new()
            .collection()
            .get_collection(|r| {
                r.collection(json!(["a"]));
                Ok(())
            })
            .apply_remove(|_r, idx| {
                assert_eq!(idx, 0);
                Ok(json!("a"))
            })
            .on_event("list", move |ev| {
                if ev.name == "remove" {
                    listener_seen.lock().unwrap().push(ev.value.clone());
                }
            }),
    );
    let fx = TestFixture::start(service).await;

    fx.service
        .with("notes.list", |r| {
            r.remove_event(0).unwrap();
        })
        .unwrap();

    let ev = fx.conn.next_published().await;
    assert_eq!(ev.subject, "event.notes.list.remove");
    assert_eq!(seen.lock().unwrap().as_slice(), &[Some(json!("a"))]);
    fx.shutdown().await;
}

#[tokio::test]
async fn create_and_delete_events_have_no_payload() {
    let service = Service::new("notes");
    service.handle("model", model_handler());
    let fx = TestFixture::start(service).await;

    fx.service
        .with("notes.model", |r| {
            r.create_event(json!({"a": 1})).unwrap();
            r.delete_event().unwrap();
        })
        .unwrap();

    let create = fx.conn.next_published().await;
    assert_eq!(create.subject, "event.notes.model.create");
    assert!(create.payload.is_empty());
    let delete = fx.conn.next_published().await;
    assert_eq!(delete.subject, "event.notes.model.delete");
    assert!(delete.payload.is_empty());
    fx.shutdown().await;
}

#[tokio::test]
async fn custom_and_reaccess_events() {
    let service = Service::new("notes");
    service.handle("model", model_handler());
    let fx = TestFixture::start(service).await;

    fx.service
        .with("notes.model", |r| {
            r.event("played", json!({"count": 3}));
            r.reaccess_event();
        })
        .unwrap();

    let custom = fx.conn.next_published().await;
    assert_eq!(custom.subject, "event.notes.model.played");
    assert_eq!(
        serde_json::from_slice::<Value>(&custom.payload).unwrap(),
        json!({"count": 3})
    );
    let reaccess = fx.conn.next_published().await;
    assert_eq!(reaccess.subject, "event.notes.model.reaccess");
    assert!(reaccess.payload.is_empty());
    fx.shutdown().await;
}

#[tokio::test]
async fn service_level_token_event() {
    let service = Service::new("notes");
    service.handle("model", model_handler());
    let fx = TestFixture::start(service).await;

    fx.service.token_event("c9", Value::Null);
    let token = fx.conn.next_published().await;
    assert_eq!(token.subject, "conn.c9.token");
    assert_eq!(
        serde_json::from_slice::<Value>(&token.payload).unwrap(),
        json!({"token": null})
    );
    fx.shutdown().await;
}

#[tokio::test]
async fn manual_reset_publishes_system_reset() {
    let service = Service::new("notes");
    service.handle("model", model_handler());
    let fx = TestFixture::start(service).await;

    fx.service
        .reset(vec!["notes.$id".to_string()], vec![]);
    let reset = fx.conn.next_published().await;
    assert_eq!(reset.subject, "system.reset");
    assert_eq!(
        serde_json::from_slice::<Value>(&reset.payload).unwrap(),
        json!({"resources": ["notes.*"]})
    );
    fx.shutdown().await;
}
