use std::sync::Arc;

use serde_json::json;

use super::*;
use crate::error::Error;
use crate::testutil::{connect, sync};

struct Harness {
    transport: Arc<crate::testing::LoopbackTransport>,
    _connection: crate::connection::Connection,
    session: crate::session::Session,
    manager: FrameManager,
}

async fn harness_with_loaded_page() -> Harness {
    let (transport, connection, session) = connect();
    let manager = FrameManager::new(session.clone());

    transport.emit(
        "Page.frameNavigated",
        json!({ "frame": { "id": "main", "loaderId": "L1", "url": "http://a.test/" } }),
        None,
    );
    transport.emit(
        "Page.lifecycleEvent",
        json!({ "frameId": "main", "loaderId": "L1", "name": "load" }),
        None,
    );
    sync(&transport, &session).await;

    Harness {
        transport,
        _connection: connection,
        session,
        manager,
    }
}

fn watcher(h: &Harness, options: NavigateOptions) -> NavigationWatcher {
    let frame = h.manager.main_frame().unwrap();
    NavigationWatcher::new(h.manager.clone(), frame, &options)
}

async fn emit_navigation(h: &Harness, loader: &str, names: &[&str]) {
    h.transport.emit(
        "Page.frameNavigated",
        json!({ "frame": { "id": "main", "loaderId": loader, "url": "http://b.test/" } }),
        None,
    );
    for name in names {
        h.transport.emit(
            "Page.lifecycleEvent",
            json!({ "frameId": "main", "loaderId": loader, "name": name }),
            None,
        );
    }
    sync(&h.transport, &h.session).await;
}

#[tokio::test]
async fn completes_when_new_document_reaches_load() {
    let h = harness_with_loaded_page().await;
    let watcher = watcher(&h, NavigateOptions::default());

    emit_navigation(&h, "L2", &["init", "load"]).await;
    watcher.wait().await.unwrap();
}

#[tokio::test]
async fn does_not_complete_before_commit() {
    let h = harness_with_loaded_page().await;
    let watcher = watcher(&h, NavigateOptions::default().timeout_ms(50));

    // The old document already has `load`, but the loader never changes.
    assert!(matches!(
        watcher.wait().await,
        Err(Error::NavigationTimeout(50))
    ));
}

#[tokio::test]
async fn waits_for_every_expected_lifecycle() {
    let h = harness_with_loaded_page().await;
    let watcher = watcher(
        &h,
        NavigateOptions::default()
            .wait_until(vec![WaitUntil::Load, WaitUntil::NetworkIdle0])
            .timeout_ms(0),
    );

    emit_navigation(&h, "L2", &["init", "load"]).await;
    // networkIdle is still missing.
    let pending = tokio::time::timeout(
        std::time::Duration::from_millis(50),
        watcher.wait(),
    )
    .await;
    assert!(pending.is_err());

    h.transport.emit(
        "Page.lifecycleEvent",
        json!({ "frameId": "main", "loaderId": "L2", "name": "networkIdle" }),
        None,
    );
    sync(&h.transport, &h.session).await;
    watcher.wait().await.unwrap();
}

#[tokio::test]
async fn waits_for_descendant_frames_recursively() {
    let h = harness_with_loaded_page().await;
    let watcher = watcher(&h, NavigateOptions::default().timeout_ms(0));

    // The child attaches before the parent finishes loading, so the parent's
    // `load` alone must not settle the navigation.
    h.transport.emit(
        "Page.frameNavigated",
        json!({ "frame": { "id": "main", "loaderId": "L2", "url": "http://b.test/" } }),
        None,
    );
    h.transport.emit(
        "Page.lifecycleEvent",
        json!({ "frameId": "main", "loaderId": "L2", "name": "init" }),
        None,
    );
    h.transport.emit(
        "Page.frameAttached",
        json!({ "frameId": "child", "parentFrameId": "main" }),
        None,
    );
    h.transport.emit(
        "Page.lifecycleEvent",
        json!({ "frameId": "child", "loaderId": "C1", "name": "init" }),
        None,
    );
    h.transport.emit(
        "Page.lifecycleEvent",
        json!({ "frameId": "main", "loaderId": "L2", "name": "load" }),
        None,
    );
    sync(&h.transport, &h.session).await;

    // The child has not loaded yet.
    let pending = tokio::time::timeout(
        std::time::Duration::from_millis(50),
        watcher.wait(),
    )
    .await;
    assert!(pending.is_err());

    h.transport.emit(
        "Page.lifecycleEvent",
        json!({ "frameId": "child", "loaderId": "C1", "name": "load" }),
        None,
    );
    sync(&h.transport, &h.session).await;
    watcher.wait().await.unwrap();
}

#[tokio::test]
async fn same_document_navigation_completes_without_new_loader() {
    let h = harness_with_loaded_page().await;
    let watcher = watcher(&h, NavigateOptions::default());

    h.transport.emit(
        "Page.navigatedWithinDocument",
        json!({ "frameId": "main", "url": "http://a.test/#x" }),
        None,
    );
    sync(&h.transport, &h.session).await;
    watcher.wait().await.unwrap();
}

#[tokio::test]
async fn frame_detach_fails_the_navigation() {
    let h = harness_with_loaded_page().await;
    let watcher = watcher(&h, NavigateOptions::default());

    h.transport
        .emit("Page.frameDetached", json!({ "frameId": "main" }), None);
    sync(&h.transport, &h.session).await;

    assert!(matches!(watcher.wait().await, Err(Error::DetachedFrame)));
}

#[tokio::test]
async fn zero_timeout_means_infinite() {
    let h = harness_with_loaded_page().await;
    let watcher = watcher(&h, NavigateOptions::default().timeout_ms(0));

    let transport = h.transport.clone();
    let session = h.session.clone();
    let emitter = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        transport.emit(
            "Page.frameNavigated",
            json!({ "frame": { "id": "main", "loaderId": "L2", "url": "http://b.test/" } }),
            None,
        );
        transport.emit(
            "Page.lifecycleEvent",
            json!({ "frameId": "main", "loaderId": "L2", "name": "load" }),
            None,
        );
        sync(&transport, &session).await;
    });

    watcher.wait().await.unwrap();
    emitter.await.unwrap();
}

#[test]
fn wait_until_maps_to_protocol_names() {
    assert_eq!(WaitUntil::Load.lifecycle_name(), "load");
    assert_eq!(WaitUntil::DomContentLoaded.lifecycle_name(), "DOMContentLoaded");
    assert_eq!(WaitUntil::NetworkIdle0.lifecycle_name(), "networkIdle");
    assert_eq!(WaitUntil::NetworkIdle2.lifecycle_name(), "networkAlmostIdle");
}
