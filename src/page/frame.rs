//! Frame tree maintenance for one page target.
//!
//! Frames form an arena keyed by frame id: parent and child links are ids
//! resolved through the manager, never owning references. All mutation
//! happens on the event-dispatch path; external callers read snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::listeners::Listeners;
use crate::protocol::{
    ExecutionContextCreatedEvent, ExecutionContextDestroyedEvent, FrameAttachedEvent,
    FrameDetachedEvent, FrameNavigatedEvent, FramePayload, FrameStoppedLoadingEvent, FrameTree,
    GetFrameTreeResult, LifecycleEventPayload, NavigatedWithinDocumentEvent,
};
use crate::session::Session;

use super::context::ExecutionContext;

/// A browsing context within a page: the main document or an iframe.
pub struct Frame {
    id: Mutex<String>,
    parent_id: Option<String>,
    manager: Weak<FrameManagerInner>,
    child_ids: Mutex<Vec<String>>,
    url: Mutex<String>,
    name: Mutex<Option<String>>,
    loader_id: Mutex<String>,
    lifecycle: Mutex<HashSet<String>>,
    context_id: Mutex<Option<u64>>,
    detached: AtomicBool,
}

impl Frame {
    fn new(id: String, parent_id: Option<String>, manager: Weak<FrameManagerInner>) -> Self {
        Self {
            id: Mutex::new(id),
            parent_id,
            manager,
            child_ids: Mutex::new(Vec::new()),
            url: Mutex::new(String::new()),
            name: Mutex::new(None),
            loader_id: Mutex::new(String::new()),
            lifecycle: Mutex::new(HashSet::new()),
            context_id: Mutex::new(None),
            detached: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> String {
        self.id.lock().clone()
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn is_main(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn url(&self) -> String {
        self.url.lock().clone()
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn loader_id(&self) -> String {
        self.loader_id.lock().clone()
    }

    pub fn child_ids(&self) -> Vec<String> {
        self.child_ids.lock().clone()
    }

    /// Lifecycle names the current document has completed.
    pub fn lifecycle(&self) -> HashSet<String> {
        self.lifecycle.lock().clone()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// The frame's default-world execution context, if installed.
    pub fn execution_context(&self) -> Option<Arc<ExecutionContext>> {
        let manager = self.manager.upgrade()?;
        let context_id = (*self.context_id.lock())?;
        manager.context(context_id)
    }

    /// Evaluate an expression in the frame's default context.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        if self.is_detached() {
            return Err(Error::DetachedFrame);
        }
        let context = self
            .execution_context()
            .ok_or(Error::ExecutionContextDestroyed)?;
        context.evaluate(expression).await
    }

    /// A new document committed: apply url/name, swap the loader id, and
    /// start a fresh lifecycle set when the loader actually changed.
    fn apply_navigation(&self, payload: &FramePayload) {
        *self.url.lock() = payload.url.clone();
        *self.name.lock() = payload.name.clone();
        let mut loader = self.loader_id.lock();
        if *loader != payload.loader_id {
            self.lifecycle.lock().clear();
            *loader = payload.loader_id.clone();
        }
    }

    fn on_lifecycle(&self, loader_id: &str, name: &str) {
        let mut loader = self.loader_id.lock();
        if *loader != loader_id {
            self.lifecycle.lock().clear();
            *loader = loader_id.to_string();
        }
        drop(loader);
        self.lifecycle.lock().insert(name.to_string());
    }

    fn on_loading_stopped(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.insert("DOMContentLoaded".to_string());
        lifecycle.insert("load".to_string());
    }
}

struct FrameTreeState {
    frames: HashMap<String, Arc<Frame>>,
    contexts: HashMap<u64, Arc<ExecutionContext>>,
    main_frame_id: Option<String>,
}

pub(crate) struct FrameManagerInner {
    session: Session,
    weak_self: Weak<FrameManagerInner>,
    state: Mutex<FrameTreeState>,
    pub(crate) frame_attached: Listeners<Arc<Frame>>,
    pub(crate) frame_detached: Listeners<Arc<Frame>>,
    pub(crate) frame_navigated: Listeners<Arc<Frame>>,
    pub(crate) frame_navigated_within_document: Listeners<Arc<Frame>>,
    pub(crate) lifecycle_event: Listeners<Arc<Frame>>,
}

/// Maintains the frame tree and execution contexts of one target.
/// Cheap to clone.
#[derive(Clone)]
pub struct FrameManager {
    inner: Arc<FrameManagerInner>,
}

impl FrameManager {
    pub(crate) fn new(session: Session) -> Self {
        let inner = Arc::new_cyclic(|weak| FrameManagerInner {
            session: session.clone(),
            weak_self: weak.clone(),
            state: Mutex::new(FrameTreeState {
                frames: HashMap::new(),
                contexts: HashMap::new(),
                main_frame_id: None,
            }),
            frame_attached: Listeners::new(),
            frame_detached: Listeners::new(),
            frame_navigated: Listeners::new(),
            frame_navigated_within_document: Listeners::new(),
            lifecycle_event: Listeners::new(),
        });

        let weak = Arc::downgrade(&inner);
        session.on_event(
            "Page.frameAttached",
            weak.clone(),
            |inner: Arc<FrameManagerInner>, ev: FrameAttachedEvent| {
                Box::pin(async move { inner.on_frame_attached(ev).await })
            },
        );
        session.on_event(
            "Page.frameNavigated",
            weak.clone(),
            |inner: Arc<FrameManagerInner>, ev: FrameNavigatedEvent| {
                Box::pin(async move { inner.on_frame_navigated(ev.frame).await })
            },
        );
        session.on_event(
            "Page.navigatedWithinDocument",
            weak.clone(),
            |inner: Arc<FrameManagerInner>, ev: NavigatedWithinDocumentEvent| {
                Box::pin(async move { inner.on_navigated_within_document(ev).await })
            },
        );
        session.on_event(
            "Page.frameDetached",
            weak.clone(),
            |inner: Arc<FrameManagerInner>, ev: FrameDetachedEvent| {
                Box::pin(async move { inner.on_frame_detached(&ev.frame_id).await })
            },
        );
        session.on_event(
            "Page.lifecycleEvent",
            weak.clone(),
            |inner: Arc<FrameManagerInner>, ev: LifecycleEventPayload| {
                Box::pin(async move { inner.on_lifecycle_event(ev).await })
            },
        );
        session.on_event(
            "Page.frameStoppedLoading",
            weak.clone(),
            |inner: Arc<FrameManagerInner>, ev: FrameStoppedLoadingEvent| {
                Box::pin(async move { inner.on_frame_stopped_loading(&ev.frame_id).await })
            },
        );
        session.on_event(
            "Runtime.executionContextCreated",
            weak.clone(),
            |inner: Arc<FrameManagerInner>, ev: ExecutionContextCreatedEvent| {
                Box::pin(async move { inner.on_execution_context_created(ev) })
            },
        );
        session.on_event(
            "Runtime.executionContextDestroyed",
            weak.clone(),
            |inner: Arc<FrameManagerInner>, ev: ExecutionContextDestroyedEvent| {
                Box::pin(async move { inner.on_execution_context_destroyed(ev.execution_context_id) })
            },
        );
        session.on_event(
            "Runtime.executionContextsCleared",
            weak,
            |inner: Arc<FrameManagerInner>, _: Value| {
                Box::pin(async move { inner.on_execution_contexts_cleared() })
            },
        );

        Self { inner }
    }

    /// Enable the Page and Runtime domains and seed the tree from the
    /// browser's current snapshot.
    pub(crate) async fn init(&self) -> Result<()> {
        let session = &self.inner.session;
        session.send("Page.enable", None).await?;
        let raw = session.send("Page.getFrameTree", None).await?;
        let tree: GetFrameTreeResult = serde_json::from_value(raw)?;
        self.inner.handle_frame_tree(tree.frame_tree).await;
        session
            .send(
                "Page.setLifecycleEventsEnabled",
                Some(json!({ "enabled": true })),
            )
            .await?;
        session.send("Runtime.enable", None).await?;
        Ok(())
    }

    pub fn main_frame(&self) -> Option<Arc<Frame>> {
        let state = self.inner.state.lock();
        let id = state.main_frame_id.as_ref()?;
        state.frames.get(id).cloned()
    }

    pub fn frame(&self, frame_id: &str) -> Option<Arc<Frame>> {
        self.inner.state.lock().frames.get(frame_id).cloned()
    }

    pub fn frames(&self) -> Vec<Arc<Frame>> {
        self.inner.state.lock().frames.values().cloned().collect()
    }

    pub(crate) fn context(&self, context_id: u64) -> Option<Arc<ExecutionContext>> {
        self.inner.context(context_id)
    }

    pub fn on_frame_attached(&self) -> &Listeners<Arc<Frame>> {
        &self.inner.frame_attached
    }

    pub fn on_frame_detached(&self) -> &Listeners<Arc<Frame>> {
        &self.inner.frame_detached
    }

    pub fn on_frame_navigated(&self) -> &Listeners<Arc<Frame>> {
        &self.inner.frame_navigated
    }

    pub fn on_frame_navigated_within_document(&self) -> &Listeners<Arc<Frame>> {
        &self.inner.frame_navigated_within_document
    }

    pub fn on_lifecycle_event(&self) -> &Listeners<Arc<Frame>> {
        &self.inner.lifecycle_event
    }
}

impl FrameManagerInner {
    fn context(&self, context_id: u64) -> Option<Arc<ExecutionContext>> {
        self.state.lock().contexts.get(&context_id).cloned()
    }

    async fn handle_frame_tree(&self, tree: FrameTree) {
        if tree.frame.parent_id.is_some() {
            self.on_frame_attached(FrameAttachedEvent {
                frame_id: tree.frame.id.clone(),
                parent_frame_id: tree.frame.parent_id.clone().unwrap_or_default(),
            })
            .await;
        }
        self.on_frame_navigated(tree.frame).await;
        for child in tree.child_frames.unwrap_or_default() {
            Box::pin(self.handle_frame_tree(child)).await;
        }
    }

    async fn on_frame_attached(&self, ev: FrameAttachedEvent) {
        let frame = {
            let mut state = self.state.lock();
            if state.frames.contains_key(&ev.frame_id) {
                return;
            }
            // An attach for an unknown parent is a protocol-ordering anomaly;
            // the subsequent frameNavigated recreates the state.
            let Some(parent) = state.frames.get(&ev.parent_frame_id).cloned() else {
                debug!("frameAttached {} under unknown parent", ev.frame_id);
                return;
            };
            let frame = Arc::new(Frame::new(
                ev.frame_id.clone(),
                Some(ev.parent_frame_id.clone()),
                self.weak_self.clone(),
            ));
            parent.child_ids.lock().push(ev.frame_id.clone());
            state.frames.insert(ev.frame_id, frame.clone());
            frame
        };
        self.frame_attached.invoke(&frame).await;
    }

    async fn on_frame_navigated(&self, payload: FramePayload) {
        let is_main = payload.parent_id.is_none();
        let mut removed = Vec::new();
        let frame = {
            let mut state = self.state.lock();
            let existing = state.frames.get(&payload.id).cloned().or_else(|| {
                if is_main {
                    let id = state.main_frame_id.clone()?;
                    state.frames.get(&id).cloned()
                } else {
                    None
                }
            });

            // A committed navigation replaces the document: every existing
            // child belongs to the old one and goes away first.
            if let Some(frame) = &existing {
                let children = frame.child_ids.lock().clone();
                for child in children {
                    Self::remove_subtree(&mut state, &child, &mut removed);
                }
                frame.child_ids.lock().clear();
            }

            let frame = if is_main {
                match existing {
                    Some(frame) => {
                        let old_id = frame.id();
                        if old_id != payload.id {
                            // Cross-process navigation reassigns the main
                            // frame id; the Frame object itself survives.
                            state.frames.remove(&old_id);
                            *frame.id.lock() = payload.id.clone();
                            state.frames.insert(payload.id.clone(), frame.clone());
                            state.main_frame_id = Some(payload.id.clone());
                        }
                        frame
                    }
                    None => {
                        let frame =
                            Arc::new(Frame::new(payload.id.clone(), None, self.weak_self.clone()));
                        state.frames.insert(payload.id.clone(), frame.clone());
                        state.main_frame_id = Some(payload.id.clone());
                        frame
                    }
                }
            } else {
                match existing {
                    Some(frame) => frame,
                    None => {
                        debug!("frameNavigated for unknown frame {}", payload.id);
                        drop(state);
                        for frame in &removed {
                            self.frame_detached.invoke(frame).await;
                        }
                        return;
                    }
                }
            };
            frame.apply_navigation(&payload);
            frame
        };

        for frame in &removed {
            self.frame_detached.invoke(frame).await;
        }
        self.frame_navigated.invoke(&frame).await;
    }

    async fn on_navigated_within_document(&self, ev: NavigatedWithinDocumentEvent) {
        let frame = self.state.lock().frames.get(&ev.frame_id).cloned();
        let Some(frame) = frame else {
            return;
        };
        *frame.url.lock() = ev.url;
        // Same-document: the loader id is untouched.
        self.frame_navigated_within_document.invoke(&frame).await;
        self.frame_navigated.invoke(&frame).await;
    }

    async fn on_frame_detached(&self, frame_id: &str) {
        let mut removed = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(frame) = state.frames.get(frame_id).cloned() {
                if let Some(parent_id) = &frame.parent_id {
                    if let Some(parent) = state.frames.get(parent_id) {
                        parent.child_ids.lock().retain(|id| id != frame_id);
                    }
                }
            }
            Self::remove_subtree(&mut state, frame_id, &mut removed);
        }
        for frame in &removed {
            self.frame_detached.invoke(frame).await;
        }
    }

    /// Depth-first removal: children leave the map before their parent.
    fn remove_subtree(state: &mut FrameTreeState, frame_id: &str, removed: &mut Vec<Arc<Frame>>) {
        let Some(frame) = state.frames.get(frame_id).cloned() else {
            return;
        };
        let children = frame.child_ids.lock().clone();
        for child in children {
            Self::remove_subtree(state, &child, removed);
        }
        frame.detached.store(true, Ordering::SeqCst);
        state.frames.remove(frame_id);
        if state.main_frame_id.as_deref() == Some(frame_id) {
            state.main_frame_id = None;
        }
        removed.push(frame);
    }

    async fn on_lifecycle_event(&self, ev: LifecycleEventPayload) {
        let frame = self.state.lock().frames.get(&ev.frame_id).cloned();
        let Some(frame) = frame else {
            return;
        };
        frame.on_lifecycle(&ev.loader_id, &ev.name);
        self.lifecycle_event.invoke(&frame).await;
    }

    async fn on_frame_stopped_loading(&self, frame_id: &str) {
        let frame = self.state.lock().frames.get(frame_id).cloned();
        let Some(frame) = frame else {
            return;
        };
        frame.on_loading_stopped();
        self.lifecycle_event.invoke(&frame).await;
    }

    fn on_execution_context_created(&self, ev: ExecutionContextCreatedEvent) {
        let description = ev.context;
        let frame_id = description.frame_id().map(str::to_string);
        let context = Arc::new(ExecutionContext::new(
            description.id,
            frame_id.clone(),
            self.session.clone(),
        ));
        let mut state = self.state.lock();
        state.contexts.insert(description.id, context);

        // Only the default world is promoted to the frame's context; other
        // worlds are tracked but never installed.
        if description.is_default() {
            if let Some(frame) = frame_id.and_then(|id| state.frames.get(&id).cloned()) {
                *frame.context_id.lock() = Some(description.id);
            }
        }
    }

    fn on_execution_context_destroyed(&self, context_id: u64) {
        let mut state = self.state.lock();
        if let Some(context) = state.contexts.remove(&context_id) {
            context.mark_destroyed();
            if let Some(frame) = context
                .frame_id()
                .and_then(|id| state.frames.get(id).cloned())
            {
                let mut installed = frame.context_id.lock();
                if *installed == Some(context_id) {
                    *installed = None;
                }
            }
        }
    }

    fn on_execution_contexts_cleared(&self) {
        let mut state = self.state.lock();
        for context in state.contexts.values() {
            context.mark_destroyed();
        }
        state.contexts.clear();
        for frame in state.frames.values() {
            *frame.context_id.lock() = None;
        }
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
