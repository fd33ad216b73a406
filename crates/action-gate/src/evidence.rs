//! Evidence collection around an action

use std::collections::BTreeMap;

use action_locator::errors::internal;
use action_locator::ops;
use cdp_adapter::{CdpSession, RemoteObjectId};
use serde::Deserialize;
use serde_json::{json, Value};
use soulact_core_types::{ActError, ActResult};
use tracing::debug;

use crate::types::{AriaDelta, AttrChange, Delta, PageState, DEFAULT_ARIA_ATTRS};

/// Which post-action evidence the caller asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceOptions {
    pub snapshot: bool,
    pub delta: bool,
    pub proof: bool,
    /// Attributes tracked on the acted-on element when `delta` is set.
    /// Empty means [`DEFAULT_ARIA_ATTRS`].
    pub aria_attrs: Vec<String>,
}

impl EvidenceOptions {
    pub fn any(&self) -> bool {
        self.snapshot || self.delta || self.proof
    }

    /// Whether a "before" capture is needed.
    pub fn needs_before(&self) -> bool {
        self.delta || self.proof
    }

    pub fn tracked_attrs(&self) -> Vec<String> {
        if self.aria_attrs.is_empty() {
            DEFAULT_ARIA_ATTRS.iter().map(|name| name.to_string()).collect()
        } else {
            self.aria_attrs.clone()
        }
    }
}

/// Url, title, focus and role counts of the main frame.
pub async fn capture_state(session: &CdpSession) -> ActResult<PageState> {
    let main = session
        .main_frame()
        .map_err(|err| internal("capture_state", err))?;
    let value = session
        .evaluate(&main, &ops::PAGE_STATE.expression(&json!({})))
        .await
        .map_err(|err| internal("capture_state", err))?;
    serde_json::from_value(value)
        .map_err(|err| ActError::internal("capture_state", format!("malformed page state: {err}")))
}

#[derive(Debug, Deserialize)]
struct AttrRead {
    connected: bool,
    #[serde(default)]
    attrs: BTreeMap<String, Option<String>>,
}

/// Reads named attributes of one element before and after an action.
pub struct AriaTracker {
    object_id: RemoteObjectId,
    names: Vec<String>,
    before: BTreeMap<String, Option<String>>,
}

impl AriaTracker {
    pub async fn begin(
        session: &CdpSession,
        object_id: RemoteObjectId,
        names: Vec<String>,
    ) -> ActResult<Self> {
        let read = read_attrs(session, &object_id, &names)
            .await
            .map_err(|err| internal("aria_read", err))?;
        Ok(Self {
            object_id,
            names,
            before: read.attrs,
        })
    }

    /// A failed read after the action means the element is gone.
    pub async fn finish(self, session: &CdpSession) -> AriaDelta {
        let (after, detached) = match read_attrs(session, &self.object_id, &self.names).await {
            Ok(read) => (read.attrs, !read.connected),
            Err(err) => {
                debug!(error = %err, "aria read after action failed; treating element as detached");
                (BTreeMap::new(), true)
            }
        };
        session.release_object(&self.object_id).await;

        let attrs = self
            .names
            .iter()
            .map(|name| {
                let before = self.before.get(name).cloned().flatten();
                let after = after.get(name).cloned().flatten();
                let changed = before != after;
                (name.clone(), AttrChange { before, after, changed })
            })
            .collect();
        AriaDelta { attrs, detached }
    }
}

async fn read_attrs(
    session: &CdpSession,
    object_id: &RemoteObjectId,
    names: &[String],
) -> Result<AttrRead, cdp_adapter::AdapterError> {
    let value = session
        .call_function_on(object_id, ops::ARIA_READ_FN, vec![json!(names)])
        .await?;
    serde_json::from_value(value).map_err(|err| {
        cdp_adapter::AdapterError::new(cdp_adapter::AdapterErrorKind::Internal)
            .with_method("Runtime.callFunctionOn")
            .with_hint(format!("malformed attribute read: {err}"))
    })
}

/// What was captured before the action.
#[derive(Default)]
pub struct BeforeCapture {
    pub state: Option<PageState>,
    aria: Option<AriaTracker>,
}

/// Evidence produced after the action.
#[derive(Debug, Clone, Default)]
pub struct AfterCapture {
    pub snapshot: Option<PageState>,
    pub delta: Option<Delta>,
    pub before: Option<PageState>,
    pub after: Option<PageState>,
}

/// Drives before/after capture for one action.
pub struct EvidenceCollector {
    options: EvidenceOptions,
}

impl EvidenceCollector {
    pub fn new(options: EvidenceOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &EvidenceOptions {
        &self.options
    }

    /// `element` is the acted-on element, when the verb has one.
    pub async fn before(
        &self,
        session: &CdpSession,
        element: Option<RemoteObjectId>,
    ) -> ActResult<BeforeCapture> {
        if !self.options.needs_before() {
            return Ok(BeforeCapture::default());
        }
        let state = capture_state(session).await?;
        let aria = match (self.options.delta, element) {
            (true, Some(object_id)) => {
                Some(AriaTracker::begin(session, object_id, self.options.tracked_attrs()).await?)
            }
            _ => None,
        };
        Ok(BeforeCapture {
            state: Some(state),
            aria,
        })
    }

    pub async fn after(&self, session: &CdpSession, before: BeforeCapture) -> ActResult<AfterCapture> {
        if !self.options.any() {
            return Ok(AfterCapture::default());
        }
        let after = capture_state(session).await?;
        let aria = match before.aria {
            Some(tracker) => Some(tracker.finish(session).await),
            None => None,
        };
        let delta = match (&before.state, self.options.delta) {
            (Some(state), true) => Some(Delta::new(state.clone(), after.clone(), aria)),
            _ => None,
        };
        Ok(AfterCapture {
            snapshot: self.options.snapshot.then(|| after.clone()),
            delta,
            before: before.state,
            after: Some(after),
        })
    }
}

/// Raw JSON of a capture, for proof details.
pub fn state_value(state: &PageState) -> Value {
    serde_json::to_value(state).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use action_locator::testing::MatchPage;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn page_state(dialogs: u32) -> Value {
        json!({
            "url": "https://e.test/",
            "title": "Menu",
            "readyState": "complete",
            "focus": { "selectorHint": "#toggle", "text": "Open", "textTruncated": false },
            "roleCounts": { "dialog": dialogs, "alert": 0, "status": 0, "menu": 0, "listbox": 0 }
        })
    }

    #[tokio::test]
    async fn delta_tracks_aria_expanded_and_dialog_count() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        let opened = Arc::new(Mutex::new(false));
        let flag = opened.clone();
        page.on_op("pageState", move |_, _| page_state(u32::from(*flag.lock())));

        let reads = Arc::new(Mutex::new(0));
        let counter = reads.clone();
        page.transport().on_fn("Runtime.callFunctionOn", move |_| {
            let mut count = counter.lock();
            *count += 1;
            let expanded = if *count == 1 { "false" } else { "true" };
            Ok(json!({ "result": { "type": "object", "value": {
                "connected": true,
                "attrs": { "aria-expanded": expanded, "aria-pressed": null, "aria-checked": null, "aria-selected": null }
            }}}))
        });

        let session = page.open().await;
        let collector = EvidenceCollector::new(EvidenceOptions {
            delta: true,
            ..EvidenceOptions::default()
        });
        let before = collector
            .before(&session, Some(RemoteObjectId("obj-MAIN-0".into())))
            .await
            .unwrap();
        *opened.lock() = true;
        let after = collector.after(&session, before).await.unwrap();

        let delta = after.delta.expect("delta requested");
        assert!(delta.after.role_counts.dialog >= delta.before.role_counts.dialog);
        let aria = delta.aria.expect("element tracked");
        let expanded = &aria.attrs["aria-expanded"];
        assert_eq!(expanded.before.as_deref(), Some("false"));
        assert_eq!(expanded.after.as_deref(), Some("true"));
        assert!(expanded.changed);
        assert!(!aria.detached);
        assert!(after.snapshot.is_none());
    }

    #[tokio::test]
    async fn failed_read_after_action_means_detached() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        let reads = Arc::new(Mutex::new(0));
        let counter = reads.clone();
        page.transport().on_fn("Runtime.callFunctionOn", move |_| {
            let mut count = counter.lock();
            *count += 1;
            if *count == 1 {
                Ok(json!({ "result": { "value": { "connected": true, "attrs": { "aria-pressed": "false" } } } }))
            } else {
                Err(cdp_adapter::AdapterError::new(cdp_adapter::AdapterErrorKind::Protocol)
                    .with_hint("cdp error -32000: Could not find object with given id"))
            }
        });
        let session = page.open().await;
        let tracker = AriaTracker::begin(
            &session,
            RemoteObjectId("obj".into()),
            vec!["aria-pressed".into()],
        )
        .await
        .unwrap();
        let delta = tracker.finish(&session).await;
        assert!(delta.detached);
        assert_eq!(delta.attrs["aria-pressed"].before.as_deref(), Some("false"));
        assert_eq!(delta.attrs["aria-pressed"].after, None);
    }

    #[tokio::test]
    async fn nothing_requested_captures_nothing() {
        let page = MatchPage::new(&["MAIN"]);
        let session = page.open().await;
        let collector = EvidenceCollector::new(EvidenceOptions::default());
        let before = collector.before(&session, None).await.unwrap();
        let after = collector.after(&session, before).await.unwrap();
        assert!(after.after.is_none());
        assert!(page.op_calls("pageState").is_empty());
    }

    #[test]
    fn default_attrs_apply_when_none_given() {
        let options = EvidenceOptions::default();
        assert_eq!(options.tracked_attrs().len(), 4);
    }
}
