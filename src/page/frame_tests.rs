use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use super::*;
use crate::testutil::{connect, sync};

struct Harness {
    transport: Arc<crate::testing::LoopbackTransport>,
    _connection: crate::connection::Connection,
    session: crate::session::Session,
    manager: FrameManager,
    log: Arc<Mutex<Vec<String>>>,
}

fn harness() -> Harness {
    let (transport, connection, session) = connect();
    let manager = FrameManager::new(session.clone());

    let log = Arc::new(Mutex::new(Vec::new()));
    let l = log.clone();
    manager.on_frame_attached().on(move |frame: &Arc<Frame>| {
        l.lock().push(format!("attached:{}", frame.id()));
    });
    let l = log.clone();
    manager.on_frame_detached().on(move |frame: &Arc<Frame>| {
        l.lock().push(format!("detached:{}", frame.id()));
    });
    let l = log.clone();
    manager.on_frame_navigated().on(move |frame: &Arc<Frame>| {
        l.lock().push(format!("navigated:{}", frame.url()));
    });
    let l = log.clone();
    manager
        .on_frame_navigated_within_document()
        .on(move |frame: &Arc<Frame>| {
            l.lock().push(format!("within:{}", frame.url()));
        });

    Harness {
        transport,
        _connection: connection,
        session,
        manager,
        log,
    }
}

fn frame_payload(id: &str, parent: Option<&str>, loader: &str, url: &str) -> Value {
    let mut payload = json!({ "id": id, "loaderId": loader, "url": url });
    if let Some(parent) = parent {
        payload["parentId"] = json!(parent);
    }
    payload
}

async fn navigate(h: &Harness, id: &str, parent: Option<&str>, loader: &str, url: &str) {
    h.transport.emit(
        "Page.frameNavigated",
        json!({ "frame": frame_payload(id, parent, loader, url) }),
        None,
    );
    sync(&h.transport, &h.session).await;
}

async fn attach(h: &Harness, id: &str, parent: &str) {
    h.transport.emit(
        "Page.frameAttached",
        json!({ "frameId": id, "parentFrameId": parent }),
        None,
    );
    sync(&h.transport, &h.session).await;
}

/// Every frame must reach the main frame by walking parent links.
fn assert_tree_rooted(manager: &FrameManager) {
    let main = manager.main_frame().expect("main frame present");
    for frame in manager.frames() {
        let mut current = frame;
        let mut hops = 0;
        while let Some(parent_id) = current.parent_id().map(str::to_string) {
            current = manager
                .frame(&parent_id)
                .expect("parent of a live frame is live");
            hops += 1;
            assert!(hops < 64, "parent chain does not terminate");
        }
        assert!(Arc::ptr_eq(&current, &main));
    }
}

#[tokio::test]
async fn builds_tree_from_events() {
    let h = harness();
    navigate(&h, "main", None, "L1", "http://a.test/").await;
    attach(&h, "child", "main").await;
    navigate(&h, "child", Some("main"), "L2", "http://a.test/frame.html").await;

    assert_eq!(h.manager.frames().len(), 2);
    let main = h.manager.main_frame().unwrap();
    assert_eq!(main.url(), "http://a.test/");
    assert_eq!(main.child_ids(), vec!["child"]);
    let child = h.manager.frame("child").unwrap();
    assert_eq!(child.url(), "http://a.test/frame.html");
    assert!(!child.is_main());
    assert_tree_rooted(&h.manager);

    assert_eq!(
        *h.log.lock(),
        vec![
            "navigated:http://a.test/",
            "attached:child",
            "navigated:http://a.test/frame.html",
        ]
    );
}

#[tokio::test]
async fn attach_under_unknown_parent_is_ignored() {
    let h = harness();
    navigate(&h, "main", None, "L1", "http://a.test/").await;
    attach(&h, "orphan", "nowhere").await;

    assert!(h.manager.frame("orphan").is_none());
    assert_eq!(h.manager.frames().len(), 1);
}

#[tokio::test]
async fn duplicate_attach_is_ignored() {
    let h = harness();
    navigate(&h, "main", None, "L1", "http://a.test/").await;
    attach(&h, "child", "main").await;
    attach(&h, "child", "main").await;

    assert_eq!(h.manager.frames().len(), 2);
    assert_eq!(h.manager.main_frame().unwrap().child_ids(), vec!["child"]);
}

#[tokio::test]
async fn detach_removes_subtree_depth_first() {
    let h = harness();
    navigate(&h, "main", None, "L1", "http://a.test/").await;
    attach(&h, "child", "main").await;
    attach(&h, "grandchild", "child").await;

    h.log.lock().clear();
    h.transport
        .emit("Page.frameDetached", json!({ "frameId": "child" }), None);
    sync(&h.transport, &h.session).await;

    assert_eq!(*h.log.lock(), vec!["detached:grandchild", "detached:child"]);
    assert_eq!(h.manager.frames().len(), 1);
    assert!(h.manager.main_frame().unwrap().child_ids().is_empty());
    assert!(h.manager.frame("child").is_none());
    assert_tree_rooted(&h.manager);
}

#[tokio::test]
async fn main_navigation_detaches_children_first() {
    let h = harness();
    navigate(&h, "main", None, "L1", "http://a.test/").await;
    attach(&h, "child", "main").await;

    h.log.lock().clear();
    navigate(&h, "main", None, "L2", "http://b.test/").await;

    assert_eq!(
        *h.log.lock(),
        vec!["detached:child", "navigated:http://b.test/"]
    );
    assert_eq!(h.manager.frames().len(), 1);
    assert_tree_rooted(&h.manager);
}

#[tokio::test]
async fn cross_process_navigation_rewrites_main_frame_id() {
    let h = harness();
    navigate(&h, "main", None, "L1", "http://a.test/").await;
    let before = h.manager.main_frame().unwrap();

    navigate(&h, "main-2", None, "L2", "http://b.test/").await;
    let after = h.manager.main_frame().unwrap();

    // Same Frame object, new identity.
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.id(), "main-2");
    assert!(h.manager.frame("main").is_none());
    assert_eq!(h.manager.frames().len(), 1);
}

#[tokio::test]
async fn new_loader_id_resets_lifecycle() {
    let h = harness();
    navigate(&h, "main", None, "L1", "http://a.test/").await;
    h.transport.emit(
        "Page.lifecycleEvent",
        json!({ "frameId": "main", "loaderId": "L1", "name": "load" }),
        None,
    );
    sync(&h.transport, &h.session).await;
    let main = h.manager.main_frame().unwrap();
    assert!(main.lifecycle().contains("load"));

    h.transport.emit(
        "Page.lifecycleEvent",
        json!({ "frameId": "main", "loaderId": "L2", "name": "init" }),
        None,
    );
    sync(&h.transport, &h.session).await;

    let lifecycle = main.lifecycle();
    assert!(!lifecycle.contains("load"));
    assert!(lifecycle.contains("init"));
    assert_eq!(main.loader_id(), "L2");
}

#[tokio::test]
async fn within_document_navigation_keeps_loader_and_lifecycle() {
    let h = harness();
    navigate(&h, "main", None, "L1", "http://a.test/").await;
    h.transport.emit(
        "Page.lifecycleEvent",
        json!({ "frameId": "main", "loaderId": "L1", "name": "load" }),
        None,
    );
    h.log.lock().clear();
    h.transport.emit(
        "Page.navigatedWithinDocument",
        json!({ "frameId": "main", "url": "http://a.test/#anchor" }),
        None,
    );
    sync(&h.transport, &h.session).await;

    let main = h.manager.main_frame().unwrap();
    assert_eq!(main.url(), "http://a.test/#anchor");
    assert_eq!(main.loader_id(), "L1");
    assert!(main.lifecycle().contains("load"));
    assert_eq!(
        *h.log.lock(),
        vec!["within:http://a.test/#anchor", "navigated:http://a.test/#anchor"]
    );
}

#[tokio::test]
async fn frame_stopped_loading_marks_both_lifecycles() {
    let h = harness();
    navigate(&h, "main", None, "L1", "http://a.test/").await;
    h.transport
        .emit("Page.frameStoppedLoading", json!({ "frameId": "main" }), None);
    sync(&h.transport, &h.session).await;

    let lifecycle = h.manager.main_frame().unwrap().lifecycle();
    assert!(lifecycle.contains("load"));
    assert!(lifecycle.contains("DOMContentLoaded"));
}

#[tokio::test]
async fn default_context_is_installed_and_cleared() {
    let h = harness();
    navigate(&h, "main", None, "L1", "http://a.test/").await;
    h.transport.emit(
        "Runtime.executionContextCreated",
        json!({ "context": {
            "id": 1,
            "auxData": { "frameId": "main", "isDefault": true },
        }}),
        None,
    );
    // A non-default world is tracked but never promoted.
    h.transport.emit(
        "Runtime.executionContextCreated",
        json!({ "context": {
            "id": 2,
            "auxData": { "frameId": "main", "isDefault": false },
        }}),
        None,
    );
    sync(&h.transport, &h.session).await;

    let main = h.manager.main_frame().unwrap();
    let context = main.execution_context().expect("default context installed");
    assert_eq!(context.id(), 1);

    h.transport.emit(
        "Runtime.executionContextDestroyed",
        json!({ "executionContextId": 1 }),
        None,
    );
    sync(&h.transport, &h.session).await;
    assert!(main.execution_context().is_none());
    assert!(context.is_destroyed());
}

#[tokio::test]
async fn contexts_cleared_uninstalls_everything() {
    let h = harness();
    navigate(&h, "main", None, "L1", "http://a.test/").await;
    h.transport.emit(
        "Runtime.executionContextCreated",
        json!({ "context": {
            "id": 1,
            "auxData": { "frameId": "main", "isDefault": true },
        }}),
        None,
    );
    sync(&h.transport, &h.session).await;
    let main = h.manager.main_frame().unwrap();
    assert!(main.execution_context().is_some());

    h.transport
        .emit("Runtime.executionContextsCleared", json!({}), None);
    sync(&h.transport, &h.session).await;
    assert!(main.execution_context().is_none());
}

#[tokio::test]
async fn evaluate_on_detached_frame_fails() {
    let h = harness();
    navigate(&h, "main", None, "L1", "http://a.test/").await;
    attach(&h, "child", "main").await;
    let child = h.manager.frame("child").unwrap();

    h.transport
        .emit("Page.frameDetached", json!({ "frameId": "child" }), None);
    sync(&h.transport, &h.session).await;

    assert!(child.is_detached());
    assert!(matches!(
        child.evaluate("1 + 1").await,
        Err(crate::error::Error::DetachedFrame)
    ));
}
