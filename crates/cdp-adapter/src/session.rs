//! One attached CDP session per invocation.
//!
//! The session owns the frame tree snapshot taken at attach time and the
//! isolated-world cache. Both die with the session; nothing here is shared
//! across invocations.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use soulact_core_types::{FrameCdpId, TargetId};
use tracing::{debug, warn};

use crate::error::{AdapterError, AdapterErrorKind};
use crate::events::EventStream;
use crate::transport::{CdpTransport, CommandTarget};

/// CDP domains the engine toggles on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Domain {
    Page,
    Network,
    Dom,
    Runtime,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Page => "Page",
            Domain::Network => "Network",
            Domain::Dom => "DOM",
            Domain::Runtime => "Runtime",
        }
    }
}

/// `Runtime.RemoteObjectId` of an element handle.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteObjectId(pub String);

impl RemoteObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameNode {
    pub id: FrameCdpId,
    pub parent: Option<FrameCdpId>,
    pub url: String,
}

/// Frames in depth-first pre-order, main frame first. The order is the
/// concatenation order for global match indices and never changes within a
/// session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameTree {
    nodes: Vec<FrameNode>,
}

impl FrameTree {
    pub fn new(nodes: Vec<FrameNode>) -> Self {
        Self { nodes }
    }

    /// Flattens a `Page.getFrameTree` result.
    pub fn from_cdp(result: &Value) -> Result<Self, AdapterError> {
        let root = result.get("frameTree").ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Protocol)
                .with_method("Page.getFrameTree")
                .with_hint("response has no frameTree")
        })?;
        let mut nodes = Vec::new();
        flatten(root, None, &mut nodes)?;
        Ok(Self { nodes })
    }

    pub fn main(&self) -> Option<&FrameNode> {
        self.nodes.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameNode> {
        self.nodes.iter()
    }

    pub fn ids(&self) -> Vec<FrameCdpId> {
        self.nodes.iter().map(|node| node.id.clone()).collect()
    }

    pub fn get(&self, id: &FrameCdpId) -> Option<&FrameNode> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_main(&self, id: &FrameCdpId) -> bool {
        self.main().map(|node| &node.id == id).unwrap_or(false)
    }
}

fn flatten(
    node: &Value,
    parent: Option<&FrameCdpId>,
    out: &mut Vec<FrameNode>,
) -> Result<(), AdapterError> {
    let frame = &node["frame"];
    let id = frame["id"].as_str().ok_or_else(|| {
        AdapterError::new(AdapterErrorKind::Protocol)
            .with_method("Page.getFrameTree")
            .with_hint("frame without id")
    })?;
    let id = FrameCdpId::from(id);
    out.push(FrameNode {
        id: id.clone(),
        parent: parent.cloned(),
        url: frame["url"].as_str().unwrap_or_default().to_string(),
    });
    if let Some(children) = node["childFrames"].as_array() {
        for child in children {
            flatten(child, Some(&id), out)?;
        }
    }
    Ok(())
}

/// `frameCdpId → executionContextId` for the isolated worlds of one session.
#[derive(Debug, Default)]
pub struct WorldCache {
    contexts: Mutex<HashMap<FrameCdpId, i64>>,
}

impl WorldCache {
    pub fn get(&self, frame: &FrameCdpId) -> Option<i64> {
        self.contexts.lock().get(frame).copied()
    }

    pub fn insert(&self, frame: FrameCdpId, context_id: i64) {
        self.contexts.lock().insert(frame, context_id);
    }

    /// Drops one frame's entry; other frames keep their worlds.
    pub fn evict(&self, frame: &FrameCdpId) -> Option<i64> {
        self.contexts.lock().remove(frame)
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
}

pub struct CdpSession {
    transport: Arc<dyn CdpTransport>,
    target_id: TargetId,
    session_id: String,
    frames: FrameTree,
    worlds: WorldCache,
    world_name: String,
    enabled: Mutex<HashSet<Domain>>,
}

impl CdpSession {
    /// Attaches to `target_id` and snapshots its frame tree.
    pub async fn open(
        transport: Arc<dyn CdpTransport>,
        target_id: TargetId,
        world_name: impl Into<String>,
    ) -> Result<Self, AdapterError> {
        let attached = transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id.as_str(), "flatten": true }),
            )
            .await?;
        let session_id = attached["sessionId"]
            .as_str()
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Protocol)
                    .with_method("Target.attachToTarget")
                    .with_hint("attach response has no sessionId")
            })?
            .to_string();

        let tree = transport
            .send_command(
                CommandTarget::Session(session_id.clone()),
                "Page.getFrameTree",
                json!({}),
            )
            .await?;
        let frames = FrameTree::from_cdp(&tree)?;

        debug!(
            target: "cdp-adapter",
            target_id = %target_id,
            session_id = %session_id,
            frames = frames.len(),
            "attached to target"
        );

        Ok(Self {
            transport,
            target_id,
            session_id,
            frames,
            worlds: WorldCache::default(),
            world_name: world_name.into(),
            enabled: Mutex::new(HashSet::new()),
        })
    }

    pub fn target_id(&self) -> &TargetId {
        &self.target_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn frames(&self) -> &FrameTree {
        &self.frames
    }

    pub fn worlds(&self) -> &WorldCache {
        &self.worlds
    }

    pub fn transport(&self) -> Arc<dyn CdpTransport> {
        self.transport.clone()
    }

    pub fn main_frame(&self) -> Result<FrameCdpId, AdapterError> {
        self.frames.main().map(|node| node.id.clone()).ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Internal).with_hint("target has no main frame")
        })
    }

    /// Session-scoped command.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        self.transport
            .send_command(CommandTarget::Session(self.session_id.clone()), method, params)
            .await
    }

    /// Browser-scoped command.
    pub async fn send_browser(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        self.transport
            .send_command(CommandTarget::Browser, method, params)
            .await
    }

    /// Subscribes to this session's events. Subscribe before triggering.
    pub fn events(&self) -> EventStream {
        EventStream::new(self.transport.subscribe(), self.session_id.clone())
    }

    pub async fn enable(&self, domain: Domain) -> Result<(), AdapterError> {
        if self.enabled.lock().contains(&domain) {
            return Ok(());
        }
        self.send(&format!("{}.enable", domain.as_str()), json!({}))
            .await?;
        self.enabled.lock().insert(domain);
        Ok(())
    }

    /// Execution context of the isolated world in `frame`, created on first use.
    pub async fn world(&self, frame: &FrameCdpId) -> Result<i64, AdapterError> {
        if let Some(context_id) = self.worlds.get(frame) {
            return Ok(context_id);
        }
        let created = self
            .send(
                "Page.createIsolatedWorld",
                json!({
                    "frameId": frame.as_str(),
                    "worldName": self.world_name,
                    "grantUniveralAccess": true,
                }),
            )
            .await?;
        let context_id = created["executionContextId"].as_i64().ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Protocol)
                .with_method("Page.createIsolatedWorld")
                .with_hint("response has no executionContextId")
        })?;
        debug!(target: "cdp-adapter", frame_id = %frame, context_id, "created isolated world");
        self.worlds.insert(frame.clone(), context_id);
        Ok(context_id)
    }

    /// Evaluates `expression` in the frame's world and returns its value.
    pub async fn evaluate(&self, frame: &FrameCdpId, expression: &str) -> Result<Value, AdapterError> {
        let result = self.evaluate_raw(frame, expression, true).await?;
        Ok(result["result"].get("value").cloned().unwrap_or(Value::Null))
    }

    /// Evaluates `expression` and keeps the result as a remote object.
    /// `None` when the expression produced `null` or `undefined`.
    pub async fn evaluate_handle(
        &self,
        frame: &FrameCdpId,
        expression: &str,
    ) -> Result<Option<RemoteObjectId>, AdapterError> {
        let result = self.evaluate_raw(frame, expression, false).await?;
        Ok(result["result"]["objectId"]
            .as_str()
            .map(|id| RemoteObjectId(id.to_string())))
    }

    async fn evaluate_raw(
        &self,
        frame: &FrameCdpId,
        expression: &str,
        by_value: bool,
    ) -> Result<Value, AdapterError> {
        let context_id = self.world(frame).await?;
        match self.evaluate_in(context_id, expression, by_value).await {
            Err(err) if err.is_stale_context() => {
                warn!(
                    target: "cdp-adapter",
                    frame_id = %frame,
                    context_id,
                    "isolated world went stale; recreating"
                );
                self.worlds.evict(frame);
                let context_id = self.world(frame).await?;
                self.evaluate_in(context_id, expression, by_value).await
            }
            other => other,
        }
    }

    async fn evaluate_in(
        &self,
        context_id: i64,
        expression: &str,
        by_value: bool,
    ) -> Result<Value, AdapterError> {
        let result = self
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "contextId": context_id,
                    "returnByValue": by_value,
                    "awaitPromise": true,
                    "userGesture": true,
                }),
            )
            .await?;
        check_exception("Runtime.evaluate", result)
    }

    /// Calls `declaration` with `this` bound to `object_id`.
    pub async fn call_function_on(
        &self,
        object_id: &RemoteObjectId,
        declaration: &str,
        args: Vec<Value>,
    ) -> Result<Value, AdapterError> {
        let arguments: Vec<Value> = args.into_iter().map(|value| json!({ "value": value })).collect();
        let result = self
            .send(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id.as_str(),
                    "functionDeclaration": declaration,
                    "arguments": arguments,
                    "returnByValue": true,
                    "awaitPromise": true,
                    "userGesture": true,
                }),
            )
            .await?;
        let result = check_exception("Runtime.callFunctionOn", result)?;
        Ok(result["result"].get("value").cloned().unwrap_or(Value::Null))
    }

    pub async fn release_object(&self, object_id: &RemoteObjectId) {
        if let Err(err) = self
            .send("Runtime.releaseObject", json!({ "objectId": object_id.as_str() }))
            .await
        {
            debug!(target: "cdp-adapter", ?err, "releaseObject failed");
        }
    }

    /// Backend node id behind a remote object.
    pub async fn backend_node_id(&self, object_id: &RemoteObjectId) -> Result<i64, AdapterError> {
        let described = self
            .send("DOM.describeNode", json!({ "objectId": object_id.as_str() }))
            .await?;
        described["node"]["backendNodeId"].as_i64().ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Protocol)
                .with_method("DOM.describeNode")
                .with_hint("node has no backendNodeId")
        })
    }

    /// Remote object for a backend node. No execution context is named, so
    /// the object lives in the page's main world of the node's document; it
    /// is grouped under the world name.
    pub async fn resolve_node(&self, backend_node_id: i64) -> Result<RemoteObjectId, AdapterError> {
        self.enable(Domain::Dom).await?;
        let resolved = self
            .send(
                "DOM.resolveNode",
                json!({ "backendNodeId": backend_node_id, "objectGroup": self.world_name }),
            )
            .await?;
        resolved["object"]["objectId"]
            .as_str()
            .map(|id| RemoteObjectId(id.to_string()))
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Protocol)
                    .with_method("DOM.resolveNode")
                    .with_hint(format!("node {backend_node_id} has no remote object"))
            })
    }

    pub async fn page_info(&self) -> Result<PageInfo, AdapterError> {
        let info = self
            .send_browser(
                "Target.getTargetInfo",
                json!({ "targetId": self.target_id.as_str() }),
            )
            .await?;
        let info = &info["targetInfo"];
        Ok(PageInfo {
            url: info["url"].as_str().unwrap_or_default().to_string(),
            title: info["title"].as_str().unwrap_or_default().to_string(),
        })
    }

    /// Offset of a frame's viewport inside the main frame's viewport.
    ///
    /// Box models are reported in root viewport coordinates, so the content
    /// box of the frame's owner element is the offset.
    pub async fn frame_offset(&self, frame: &FrameCdpId) -> Result<(f64, f64), AdapterError> {
        if self.frames.is_main(frame) {
            return Ok((0.0, 0.0));
        }
        self.enable(Domain::Dom).await?;
        let owner = self
            .send("DOM.getFrameOwner", json!({ "frameId": frame.as_str() }))
            .await?;
        let backend_node_id = owner["backendNodeId"].as_i64().ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Protocol)
                .with_method("DOM.getFrameOwner")
                .with_hint(format!("frame {frame} has no owner element"))
        })?;
        let model = self
            .send("DOM.getBoxModel", json!({ "backendNodeId": backend_node_id }))
            .await?;
        let content = quad(&model["model"]["content"]).ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Protocol)
                .with_method("DOM.getBoxModel")
                .with_hint("owner element has no content quad")
        })?;
        Ok((content[0], content[1]))
    }

    /// Detaches and closes the transport. Errors are logged and dropped.
    pub async fn release(&self) {
        if let Err(err) = self
            .send_browser(
                "Target.detachFromTarget",
                json!({ "sessionId": self.session_id }),
            )
            .await
        {
            debug!(target: "cdp-adapter", ?err, "detach failed during release");
        }
        self.transport.shutdown().await;
    }
}

/// Eight numbers of a CDP quad, or `None` when malformed.
pub fn quad(value: &Value) -> Option<[f64; 8]> {
    let items = value.as_array()?;
    if items.len() < 8 {
        return None;
    }
    let mut out = [0.0; 8];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item.as_f64()?;
    }
    Some(out)
}

fn check_exception(method: &str, result: Value) -> Result<Value, AdapterError> {
    if let Some(details) = result.get("exceptionDetails") {
        let text = details["exception"]["description"]
            .as_str()
            .or_else(|| details["text"].as_str())
            .unwrap_or("script exception")
            .to_string();
        return Err(AdapterError::new(AdapterErrorKind::ScriptException)
            .with_method(method)
            .with_hint(text)
            .with_data(details.clone()));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PageFixture, ScriptedTransport, FIXTURE_WORLD};

    fn nested_tree() -> Value {
        json!({
            "frameTree": {
                "frame": { "id": "MAIN", "url": "https://e.test/" },
                "childFrames": [
                    {
                        "frame": { "id": "A", "parentId": "MAIN", "url": "https://e.test/a" },
                        "childFrames": [
                            { "frame": { "id": "A1", "parentId": "A", "url": "about:blank" } }
                        ]
                    },
                    { "frame": { "id": "B", "parentId": "MAIN", "url": "https://e.test/b" } }
                ]
            }
        })
    }

    #[test]
    fn frame_tree_is_depth_first_main_first() {
        let tree = FrameTree::from_cdp(&nested_tree()).unwrap();
        let ids: Vec<_> = tree.iter().map(|node| node.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["MAIN", "A", "A1", "B"]);
        assert_eq!(tree.get(&"A1".into()).unwrap().parent, Some("A".into()));
        assert!(tree.is_main(&"MAIN".into()));
    }

    #[test]
    fn frame_tree_requires_root() {
        let err = FrameTree::from_cdp(&json!({})).unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Protocol);
    }

    #[test]
    fn world_cache_eviction_is_per_frame() {
        let cache = WorldCache::default();
        cache.insert("A".into(), 1);
        cache.insert("B".into(), 2);
        assert_eq!(cache.evict(&"A".into()), Some(1));
        assert_eq!(cache.get(&"B".into()), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn worlds_are_created_once_per_frame() {
        let fixture = PageFixture::new(&["MAIN", "CHILD"]);
        let transport = fixture.transport();
        transport.on("Runtime.evaluate", json!({ "result": { "type": "number", "value": 7 } }));
        let session = fixture.open().await;

        let main = session.main_frame().unwrap();
        assert_eq!(session.evaluate(&main, "7").await.unwrap(), json!(7));
        assert_eq!(session.evaluate(&main, "7").await.unwrap(), json!(7));
        session.evaluate(&"CHILD".into(), "7").await.unwrap();

        assert_eq!(transport.calls_for("Page.createIsolatedWorld").len(), 2);
        assert_eq!(session.worlds().len(), 2);
    }

    #[tokio::test]
    async fn stale_world_is_recreated_once() {
        let fixture = PageFixture::new(&["MAIN"]);
        let transport = fixture.transport();
        let attempts = Arc::new(Mutex::new(0));
        let seen = attempts.clone();
        transport.on_fn("Runtime.evaluate", move |_| {
            let mut count = seen.lock();
            *count += 1;
            if *count == 1 {
                Err(AdapterError::new(AdapterErrorKind::Protocol)
                    .with_hint("cdp error -32000: Cannot find context with specified id"))
            } else {
                Ok(json!({ "result": { "type": "string", "value": "ok" } }))
            }
        });
        let session = fixture.open().await;

        let value = session.evaluate(&"MAIN".into(), "'ok'").await.unwrap();
        assert_eq!(value, json!("ok"));
        assert_eq!(*attempts.lock(), 2);
        assert_eq!(transport.calls_for("Page.createIsolatedWorld").len(), 2);
    }

    #[tokio::test]
    async fn exceptions_become_script_errors() {
        let fixture = PageFixture::new(&["MAIN"]);
        let transport = fixture.transport();
        transport.on(
            "Runtime.evaluate",
            json!({
                "result": { "type": "object" },
                "exceptionDetails": { "text": "Uncaught", "exception": { "description": "TypeError: boom" } }
            }),
        );
        let session = fixture.open().await;
        let err = session.evaluate(&"MAIN".into(), "boom()").await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::ScriptException);
        assert_eq!(err.hint.as_deref(), Some("TypeError: boom"));
        assert_eq!(err.method.as_deref(), Some("Runtime.evaluate"));
    }

    #[tokio::test]
    async fn release_detaches_and_swallows_errors() {
        let fixture = PageFixture::new(&["MAIN"]);
        let transport = fixture.transport();
        transport.on_fn("Target.detachFromTarget", |_| {
            Err(AdapterError::new(AdapterErrorKind::CdpIo).with_hint("gone"))
        });
        let session = fixture.open().await;
        session.release().await;
        assert_eq!(transport.calls_for("Target.detachFromTarget").len(), 1);
        assert!(transport.is_shut_down());
    }

    #[tokio::test]
    async fn child_frame_offset_uses_owner_content_box() {
        let fixture = PageFixture::new(&["MAIN", "CHILD"]);
        let transport = fixture.transport();
        transport.on("DOM.getFrameOwner", json!({ "backendNodeId": 42 }));
        transport.on(
            "DOM.getBoxModel",
            json!({ "model": { "content": [10.0, 20.0, 110.0, 20.0, 110.0, 80.0, 10.0, 80.0] } }),
        );
        let session = fixture.open().await;
        assert_eq!(session.frame_offset(&"MAIN".into()).await.unwrap(), (0.0, 0.0));
        assert_eq!(session.frame_offset(&"CHILD".into()).await.unwrap(), (10.0, 20.0));
    }

    #[tokio::test]
    async fn resolve_node_groups_object_under_world_name() {
        let fixture = PageFixture::new(&["MAIN"]);
        let transport = fixture.transport();
        transport.on("DOM.resolveNode", json!({ "object": { "type": "object", "objectId": "obj-9" } }));
        let session = fixture.open().await;

        let object = session.resolve_node(9).await.unwrap();
        assert_eq!(object, RemoteObjectId("obj-9".to_string()));
        let call = &transport.calls_for("DOM.resolveNode")[0];
        assert_eq!(call.params["backendNodeId"], 9);
        assert_eq!(call.params["objectGroup"], FIXTURE_WORLD);
        assert!(call.params.get("executionContextId").is_none());
    }
}
