//! Wait-after-action budgeter and the post-action settle

use std::time::Duration;

use action_locator::errors::internal;
use action_locator::ops;
use action_locator::{FrameScope, QueryResolver};
use cdp_adapter::{CdpSession, NetworkMonitor};
use network_tap_light::NetworkSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::json;
use soulact_core_types::{ActError, ActResult, QueryFailure, WaitContext, WaitPhase};
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

/// Caller wait options as given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitSpec {
    pub text: Option<String>,
    pub selector: Option<String>,
    pub network_idle: bool,
}

/// The single post-action condition to wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitMode {
    Text(String),
    Selector(String),
    NetworkIdle,
}

impl WaitMode {
    pub fn name(&self) -> &'static str {
        match self {
            WaitMode::Text(_) => "text",
            WaitMode::Selector(_) => "selector",
            WaitMode::NetworkIdle => "network-idle",
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            WaitMode::Text(value) | WaitMode::Selector(value) => Some(value),
            WaitMode::NetworkIdle => None,
        }
    }
}

impl WaitSpec {
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.selector.is_none() && !self.network_idle
    }

    /// At most one condition; checked before any browser call.
    pub fn validate(&self) -> ActResult<Option<WaitMode>> {
        let mut set = Vec::new();
        if self.text.is_some() {
            set.push("--wait-for-text");
        }
        if self.selector.is_some() {
            set.push("--wait-for-selector");
        }
        if self.network_idle {
            set.push("--wait-network-idle");
        }
        if set.len() > 1 {
            let conflicting: Vec<String> = set.iter().map(|flag| flag.to_string()).collect();
            return Err(ActError::query(
                QueryFailure::MutuallyExclusive,
                format!("only one wait condition is allowed, got {}", set.join(", ")),
            )
            .with_hint("keep a single --wait-* option")
            .with_query_context(|ctx| ctx.conflicting = conflicting));
        }

        if let Some(text) = &self.text {
            if text.trim().is_empty() {
                return Err(ActError::query(
                    QueryFailure::InvalidOptions,
                    "--wait-for-text must not be empty",
                ));
            }
            return Ok(Some(WaitMode::Text(text.clone())));
        }
        if let Some(selector) = &self.selector {
            if selector.trim().is_empty() {
                return Err(ActError::query(
                    QueryFailure::InvalidOptions,
                    "--wait-for-selector must not be empty",
                ));
            }
            return Ok(Some(WaitMode::Selector(selector.clone())));
        }
        Ok(self.network_idle.then_some(WaitMode::NetworkIdle))
    }
}

/// Evidence of a satisfied wait.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitResult {
    pub mode: &'static str,
    pub value: Option<String>,
    pub satisfied: bool,
    pub elapsed_ms: u64,
    pub polls: u32,
    pub timeout_ms: u64,
    pub frame_scope: &'static str,
    pub network: Option<NetworkSnapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectorProbe {
    valid: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    visible_count: usize,
}

#[derive(Debug, Deserialize)]
struct TextProbe {
    found: bool,
}

/// Polls one condition against a deadline, one probe at a time.
pub struct WaitBudgeter<'a> {
    session: &'a CdpSession,
    scope: FrameScope,
    timeout: Duration,
    interval: Duration,
}

impl<'a> WaitBudgeter<'a> {
    pub fn new(session: &'a CdpSession, scope: FrameScope, timeout: Duration, interval: Duration) -> Self {
        Self {
            session,
            scope,
            timeout,
            interval,
        }
    }

    /// Rejects a malformed `--wait-for-selector` before the action runs.
    pub async fn prevalidate(&self, mode: &WaitMode) -> ActResult<()> {
        let WaitMode::Selector(selector) = mode else {
            return Ok(());
        };
        let main = self
            .session
            .main_frame()
            .map_err(|err| internal("wait", err))?;
        self.probe_selector(&main, selector).await.map(|_| ())
    }

    async fn probe_selector(&self, frame: &soulact_core_types::FrameCdpId, selector: &str) -> ActResult<bool> {
        let value = QueryResolver::new(self.session)
            .run(frame, ops::SELECTOR_STATE, &json!({ "selector": selector }))
            .await?;
        let probe: SelectorProbe = serde_json::from_value(value)
            .map_err(|err| ActError::internal("wait", format!("malformed selector probe: {err}")))?;
        if !probe.valid {
            return Err(ActError::query(
                QueryFailure::InvalidSelector,
                format!(
                    "--wait-for-selector {selector:?} is not a valid CSS selector: {}",
                    probe.message.unwrap_or_default()
                ),
            )
            .with_hint("fix the --wait-for-selector syntax"));
        }
        Ok(probe.visible_count > 0)
    }

    async fn probe_text(&self, frame: &soulact_core_types::FrameCdpId, text: &str) -> ActResult<bool> {
        let value = QueryResolver::new(self.session)
            .run(frame, ops::TEXT_VISIBLE, &json!({ "text": text }))
            .await?;
        let probe: TextProbe = serde_json::from_value(value)
            .map_err(|err| ActError::internal("wait", format!("malformed text probe: {err}")))?;
        Ok(probe.found)
    }

    /// One pass over the scoped frames. Frames that fail to evaluate are
    /// treated as not (yet) satisfying the condition.
    async fn probe(&self, mode: &WaitMode) -> ActResult<bool> {
        let frames = QueryResolver::new(self.session).frames_for_scope(self.scope);
        for frame in &frames {
            let outcome = match mode {
                WaitMode::Text(text) => self.probe_text(frame, text).await,
                WaitMode::Selector(selector) => self.probe_selector(frame, selector).await,
                WaitMode::NetworkIdle => return Ok(true),
            };
            match outcome {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err @ ActError::QueryInvalid { .. }) => return Err(err),
                Err(err) => debug!(frame_id = %frame, error = %err, "wait probe failed"),
            }
        }
        Ok(false)
    }

    fn timeout_error(&self, mode: &WaitMode, elapsed: Duration, frames: usize) -> ActError {
        let timeout_ms = self.timeout.as_millis() as u64;
        let mut err = ActError::wait_timeout(
            WaitContext {
                phase: WaitPhase::PostAction,
                mode: Some(mode.name().to_string()),
                value: mode.value().map(str::to_string),
                timeout_ms,
                elapsed_ms: elapsed.as_millis() as u64,
                frame_scope: Some(self.scope.as_str().to_string()),
                frames_checked: frames,
            },
            format!(
                "{} wait not satisfied within {timeout_ms}ms",
                mode.name()
            ),
        );
        if self.scope == FrameScope::Main && self.session.frames().len() > 1 {
            err = err.with_hint("the page has iframes; retry with --frame-scope all");
        }
        err = err.with_hint("increase --timeout if the page is slow to update");
        match mode {
            WaitMode::Selector(_) => err.with_hint("the selector must match a visible element"),
            WaitMode::Text(_) => err.with_hint("text is matched case-insensitively against visible page text"),
            WaitMode::NetworkIdle => err.with_hint("long-polling or streaming requests keep the network busy"),
        }
    }

    /// Waits for `mode`. Network idle needs the monitor started before the
    /// action.
    pub async fn run(&self, mode: &WaitMode, monitor: Option<&NetworkMonitor>) -> ActResult<WaitResult> {
        let started = Instant::now();
        let timeout_ms = self.timeout.as_millis() as u64;

        if let WaitMode::NetworkIdle = mode {
            let monitor = monitor.ok_or_else(|| {
                ActError::internal("wait", "network-idle wait without a network monitor")
            })?;
            return match monitor.tap().wait_for_idle(self.timeout).await {
                Ok(snapshot) => Ok(WaitResult {
                    mode: mode.name(),
                    value: None,
                    satisfied: true,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    polls: 0,
                    timeout_ms,
                    frame_scope: self.scope.as_str(),
                    network: Some(snapshot),
                }),
                Err(err) => Err(self
                    .timeout_error(mode, started.elapsed(), 0)
                    .with_hint(err.to_string())),
            };
        }

        let frames = QueryResolver::new(self.session).frames_for_scope(self.scope).len();
        let deadline = started + self.timeout;
        let mut polls = 0u32;
        loop {
            polls += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let satisfied = match timeout(remaining, self.probe(mode)).await {
                Ok(outcome) => outcome?,
                Err(_) => {
                    debug!(mode = mode.name(), polls, "wait poll outlived the deadline");
                    return Err(self.timeout_error(mode, started.elapsed(), frames));
                }
            };
            if satisfied {
                let elapsed = started.elapsed();
                debug!(mode = mode.name(), polls, elapsed_ms = elapsed.as_millis() as u64, "wait satisfied");
                return Ok(WaitResult {
                    mode: mode.name(),
                    value: mode.value().map(str::to_string),
                    satisfied: true,
                    elapsed_ms: elapsed.as_millis() as u64,
                    polls,
                    timeout_ms,
                    frame_scope: self.scope.as_str(),
                    network: None,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self.timeout_error(mode, started.elapsed(), frames));
            }
            sleep(self.interval.min(deadline - now)).await;
        }
    }
}

/// Waits until the main document has left `loading`, up to `budget`.
/// Any failure just ends the settle.
pub async fn settle(session: &CdpSession, budget: Duration) {
    let started = Instant::now();
    let deadline = started + budget;
    let Ok(main) = session.main_frame() else {
        return;
    };
    let expression = ops::READY_STATE.expression(&json!({}));
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Ok(evaluated) = timeout(remaining, session.evaluate(&main, &expression)).await else {
            debug!(budget_ms = budget.as_millis() as u64, "settle budget exhausted");
            return;
        };
        match evaluated {
            Ok(value) if value["readyState"].as_str().is_some_and(|state| state != "loading") => {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "page settled");
                return;
            }
            Ok(_) => {}
            Err(err) => debug!(error = %err, "settle probe failed"),
        }
        let now = Instant::now();
        if now >= deadline {
            debug!(budget_ms = budget.as_millis() as u64, "settle budget exhausted");
            return;
        }
        sleep(Duration::from_millis(50).min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use action_locator::testing::MatchPage;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn more_than_one_condition_is_rejected() {
        let spec = WaitSpec {
            text: Some("Saved".into()),
            network_idle: true,
            ..WaitSpec::default()
        };
        let err = spec.validate().unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::MutuallyExclusive));
        match err {
            ActError::QueryInvalid { context, .. } => {
                assert_eq!(context.conflicting, vec!["--wait-for-text", "--wait-network-idle"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(WaitSpec::default().validate().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn text_wait_polls_until_visible() {
        let page = MatchPage::new(&["MAIN"]);
        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();
        page.on_op("textVisible", move |_, _| {
            let mut count = counter.lock();
            *count += 1;
            json!({ "found": *count >= 3 })
        });
        let session = page.open().await;
        let budgeter = WaitBudgeter::new(
            &session,
            FrameScope::Main,
            Duration::from_secs(2),
            Duration::from_millis(200),
        );
        let result = budgeter
            .run(&WaitMode::Text("Saved".into()), None)
            .await
            .unwrap();
        assert!(result.satisfied);
        assert_eq!(result.polls, 3);
        assert_eq!(result.mode, "text");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_suggests_wider_scope_when_frames_exist() {
        let page = MatchPage::new(&["MAIN", "CHILD"]);
        let session = page.open().await;
        let budgeter = WaitBudgeter::new(
            &session,
            FrameScope::Main,
            Duration::from_millis(600),
            Duration::from_millis(200),
        );
        let err = budgeter
            .run(&WaitMode::Text("never".into()), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_WAIT_TIMEOUT");
        assert!(err.hints().as_slice()[0].contains("--frame-scope all"));
        match err {
            ActError::WaitTimeout { context, .. } => {
                assert_eq!(context.mode.as_deref(), Some("text"));
                assert_eq!(context.timeout_ms, 600);
                assert_eq!(context.frames_checked, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_poll_is_cut_off_at_the_deadline() {
        let page = MatchPage::new(&["MAIN"]);
        let session = page.open().await;
        page.transport().delay("Runtime.evaluate", Duration::from_secs(30));
        let budgeter = WaitBudgeter::new(
            &session,
            FrameScope::Main,
            Duration::from_millis(600),
            Duration::from_millis(200),
        );

        let started = Instant::now();
        let err = budgeter
            .run(&WaitMode::Text("Saved".into()), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_WAIT_TIMEOUT");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn settle_gives_up_on_a_hung_page() {
        let page = MatchPage::new(&["MAIN"]);
        let session = page.open().await;
        page.transport().delay("Runtime.evaluate", Duration::from_secs(30));

        let started = Instant::now();
        settle(&session, Duration::from_millis(300)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn invalid_selector_fails_prevalidation() {
        let page = MatchPage::new(&["MAIN"]);
        page.on_op("selectorState", |_, _| {
            json!({ "valid": false, "message": "bad", "count": 0, "visibleCount": 0 })
        });
        let session = page.open().await;
        let budgeter = WaitBudgeter::new(
            &session,
            FrameScope::Main,
            Duration::from_secs(1),
            Duration::from_millis(200),
        );
        let err = budgeter
            .prevalidate(&WaitMode::Selector("div[".into()))
            .await
            .unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::InvalidSelector));
    }

    #[tokio::test(start_paused = true)]
    async fn selector_wait_checks_child_frames_with_all_scope() {
        let page = MatchPage::new(&["MAIN", "CHILD"]);
        page.on_op("selectorState", |frame, _| {
            let visible = usize::from(frame == "CHILD");
            json!({ "valid": true, "count": visible, "visibleCount": visible })
        });
        let session = page.open().await;
        let budgeter = WaitBudgeter::new(
            &session,
            FrameScope::All,
            Duration::from_secs(1),
            Duration::from_millis(200),
        );
        let result = budgeter
            .run(&WaitMode::Selector(".toast".into()), None)
            .await
            .unwrap();
        assert_eq!(result.polls, 1);
        assert_eq!(result.frame_scope, "all");
    }

    #[tokio::test(start_paused = true)]
    async fn settle_returns_after_loading() {
        let page = MatchPage::new(&["MAIN"]);
        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();
        page.on_op("readyState", move |_, _| {
            let mut count = counter.lock();
            *count += 1;
            json!({ "readyState": if *count < 2 { "loading" } else { "interactive" } })
        });
        let session = page.open().await;
        settle(&session, Duration::from_millis(1000)).await;
        assert_eq!(*calls.lock(), 2);
    }
}
