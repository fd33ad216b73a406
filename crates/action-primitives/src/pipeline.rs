//! One invocation end to end: session, target, resolution, action, wait,
//! evidence, persistence.

use std::sync::Arc;
use std::time::Instant;

use action_gate::{capture_state, count_after, EvidenceCollector, ProofEnvelope, ProofInput};
use action_locator::errors::AdapterResultExt;
use action_locator::{explain, ExplainReport, FrameScope, QueryResolver};
use async_trait::async_trait;
use cdp_adapter::{list_pages, AdapterError, CdpConfig, CdpSession, CdpTransport, ChromiumTransport, NetworkMonitor};
use soulact_core_types::{
    ActError, ActResult, ActionId, ActionKind, AssertionOutcome, QueryFailure, SessionHandle, TargetId,
};
use soulact_state_center::{now_ms, ResolvedSession, StateError, StateStore, TargetSnapshot};
use tracing::{debug, info, warn};

use crate::primitives::execute;
use crate::report::{ActionReport, ExplainEnvelope, Report, TimingMs, VerbOutcome};
use crate::request::{ActionPlan, ActionRequest, PlannedVerb};
use crate::types::{tracked_element, ActionTarget, EngineConfig, ExecCtx, Executed};
use crate::waiting::{settle, WaitBudgeter, WaitMode, WaitResult};

/// Opens the CDP transport for a session's origin.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &CdpConfig) -> Result<Arc<dyn CdpTransport>, AdapterError>;
}

/// Connects to a running Chromium over its DevTools endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChromiumConnector;

#[async_trait]
impl Connector for ChromiumConnector {
    async fn connect(&self, config: &CdpConfig) -> Result<Arc<dyn CdpTransport>, AdapterError> {
        let transport: Arc<dyn CdpTransport> = Arc::new(ChromiumTransport::connect(config).await?);
        Ok(transport)
    }
}

pub(crate) fn state_error(err: StateError) -> ActError {
    match err {
        StateError::UnknownSession(id) => ActError::query(
            QueryFailure::UnknownSession,
            format!("unknown session {id:?}"),
        )
        .with_hint("pass a CDP origin (http://host:port) to start a new session")
        .with_hint("omit --session to use the default origin"),
        other => ActError::internal("state", other.to_string()),
    }
}

/// Everything the action phase produced, before the report is assembled.
struct Acted {
    target: ActionTarget,
    executed: Executed,
    wait: Option<WaitResult>,
    capture: action_gate::AfterCapture,
    assertions: Option<Vec<AssertionOutcome>>,
    proof: Option<ProofEnvelope>,
    /// Url and title recorded for the acted-on tab.
    page: (String, String),
}

enum Phase {
    Acted(Box<Acted>),
    Explained(ExplainReport),
}

/// Runs [`ActionRequest`]s against live tabs.
pub struct ActionPipeline {
    store: Arc<dyn StateStore>,
    connector: Arc<dyn Connector>,
    config: EngineConfig,
}

impl ActionPipeline {
    pub fn new(store: Arc<dyn StateStore>, connector: Arc<dyn Connector>, config: EngineConfig) -> Self {
        Self {
            store,
            connector,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates, acts and reports. Option errors surface before any
    /// session is resolved or any CDP call is made.
    pub async fn run(&self, request: &ActionRequest) -> ActResult<Report> {
        let plan = request.validate()?;
        let action_id = ActionId::new();
        let mut timing = TimingMs::default();

        let clock = Instant::now();
        let resolved = self
            .store
            .resolve(
                request.session.as_deref(),
                request.target.as_deref(),
                &self.config.cdp.origin,
            )
            .await
            .map_err(state_error)?;
        timing.resolve_session = elapsed_ms(clock);
        debug!(action_id = %action_id, session = %resolved.handle, "session resolved");

        let clock = Instant::now();
        let session = self.open_session(&resolved).await?;
        timing.connect_cdp = elapsed_ms(clock);
        let target_id = session.target_id().clone();
        info!(
            action_id = %action_id,
            action = plan.kind.as_str(),
            target_id = %target_id,
            "invocation started"
        );

        let clock = Instant::now();
        let phase = self.act(&plan, request, &session, &action_id).await;
        session.release().await;
        timing.action = elapsed_ms(clock);
        let handle = resolved.handle;

        match phase? {
            Phase::Explained(report) => Ok(Report::Explain(Box::new(ExplainEnvelope {
                ok: true,
                action: plan.kind,
                action_id,
                session_id: handle.session_id,
                session_source: handle.session_source,
                target_id,
                report,
                timing_ms: timing,
            }))),
            Phase::Acted(acted) => {
                let acted = *acted;
                let clock = Instant::now();
                self.persist(&handle, &target_id, &action_id, plan.kind, &acted)
                    .await;
                timing.persist_state = elapsed_ms(clock);

                if let Some(outcomes) = &acted.assertions {
                    action_gate::check(outcomes)?;
                }
                info!(
                    action_id = %action_id,
                    elapsed_ms = timing.action,
                    "invocation finished"
                );
                Ok(Report::Action(Box::new(ActionReport {
                    ok: true,
                    action: plan.kind,
                    action_id,
                    session_id: handle.session_id,
                    session_source: handle.session_source,
                    target_id,
                    match_count: acted.target.match_count(),
                    picked_index: acted.target.picked_index(),
                    outcome: acted.executed.outcome,
                    wait: acted.wait,
                    snapshot: acted.capture.snapshot,
                    delta: acted.capture.delta,
                    assertions: acted.assertions,
                    proof: acted.proof,
                    timing_ms: timing,
                })))
            }
        }
    }

    /// Connects, picks the target and attaches. The transport is shut down
    /// if anything after connecting fails.
    async fn open_session(&self, resolved: &ResolvedSession) -> ActResult<CdpSession> {
        let cdp = CdpConfig {
            origin: resolved.handle.cdp_origin.clone(),
            ..self.config.cdp.clone()
        };
        let transport = self.connector.connect(&cdp).await.or_internal("connect_cdp")?;
        let target = match self.pick_target(transport.as_ref(), resolved).await {
            Ok(target) => target,
            Err(err) => {
                transport.shutdown().await;
                return Err(err);
            }
        };
        match CdpSession::open(transport.clone(), target, cdp.world_name.clone()).await {
            Ok(session) => Ok(session),
            Err(err) => {
                transport.shutdown().await;
                Err(action_locator::errors::internal("attach", err))
            }
        }
    }

    /// Explicit target, else the session's last acted-on tab if it is still
    /// open, else the first page.
    async fn pick_target(&self, transport: &dyn CdpTransport, resolved: &ResolvedSession) -> ActResult<TargetId> {
        let pages = list_pages(transport).await.or_internal("list_targets")?;
        let listed = |id: &TargetId| pages.iter().any(|page| &page.target_id == id);

        if let Some(hint) = &resolved.target_hint {
            if listed(hint) {
                return Ok(hint.clone());
            }
            return Err(ActError::query(
                QueryFailure::TargetNotFound,
                format!("target {hint} is not an open page"),
            )
            .with_hint("omit --target to act on the session's current tab"));
        }

        let latest = self
            .store
            .latest_for_session(&resolved.handle.session_id)
            .await
            .map_err(state_error)?;
        if let Some(snapshot) = latest.filter(|snapshot| listed(&snapshot.target_id)) {
            return Ok(snapshot.target_id);
        }

        pages.into_iter().next().map(|page| page.target_id).ok_or_else(|| {
            ActError::query(QueryFailure::TargetNotFound, "the browser has no open page")
                .with_hint("open a tab in the browser first")
        })
    }

    async fn act(
        &self,
        plan: &ActionPlan,
        request: &ActionRequest,
        session: &CdpSession,
        action_id: &ActionId,
    ) -> ActResult<Phase> {
        let resolver = QueryResolver::new(session);

        if matches!(plan.verb, PlannedVerb::Explain) {
            let query = plan
                .query
                .as_ref()
                .ok_or_else(|| ActError::internal("explain", "explain without a query"))?;
            return explain(&resolver, query).await.map(Phase::Explained);
        }

        let target = match &plan.query {
            Some(query) if query.is_handle() => {
                let node = query
                    .backend_node_id
                    .ok_or_else(|| ActError::internal("resolve", "handle query without a node id"))?;
                ActionTarget::Handle(node)
            }
            Some(query) => ActionTarget::Query(resolver.resolve(query).await?),
            None => ActionTarget::None,
        };

        let scope = plan
            .query
            .as_ref()
            .map(|query| query.frame_scope)
            .unwrap_or(FrameScope::Main);
        let budgeter = WaitBudgeter::new(session, scope, plan.timeout, self.config.poll_interval());
        if let Some(mode) = &plan.wait {
            budgeter.prevalidate(mode).await?;
        }

        let monitor = if matches!(plan.wait, Some(WaitMode::NetworkIdle)) || plan.kind == ActionKind::Download {
            Some(
                NetworkMonitor::start(session, self.config.tap_config())
                    .await
                    .or_internal("network_tap")?,
            )
        } else {
            None
        };

        let collector = EvidenceCollector::new(request.evidence.clone());
        let element = if request.evidence.delta {
            tracked_element(session, &target).await?
        } else {
            None
        };
        let before = collector.before(session, element).await?;

        let ctx = ExecCtx {
            action_id: action_id.clone(),
            kind: plan.kind,
            session,
            config: &self.config,
            timeout: plan.timeout,
            monitor: monitor.as_ref(),
        };
        let executed = execute(&ctx, &plan.verb, &target).await?;
        settle(session, self.config.settle_budget(plan.timeout)).await;

        let wait = match &plan.wait {
            Some(mode) => Some(budgeter.run(mode, monitor.as_ref()).await?),
            None => None,
        };
        let capture = collector.after(session, before).await?;

        let assertions = if request.assertions.is_empty() {
            None
        } else {
            let state = match &capture.after {
                Some(state) => state.clone(),
                None => capture_state(session).await?,
            };
            Some(action_gate::evaluate(session, &request.assertions, &state).await?)
        };

        let proof = if request.evidence.proof {
            let recount = match &plan.query {
                Some(query) => count_after(&resolver, query).await,
                None => None,
            };
            let wait_evidence = wait
                .as_ref()
                .and_then(|result| serde_json::to_value(result).ok());
            Some(ProofEnvelope::build(
                ProofInput {
                    target_before: session.target_id().clone(),
                    target_after: executed.target_after.clone(),
                    match_count: target.match_count(),
                    picked_index: target.picked_index(),
                    wait_evidence,
                    assertions: assertions.clone(),
                    count_after: recount,
                    details: executed.details.clone(),
                },
                &capture,
            ))
        } else {
            None
        };

        let page = match (&executed.outcome, &capture.after) {
            (VerbOutcome::Spawned(spawned), _) => (spawned.url.clone(), spawned.title.clone()),
            (_, Some(state)) => (state.url.clone(), state.title.clone()),
            _ => match session.page_info().await {
                Ok(info) => (info.url, info.title),
                Err(err) => {
                    debug!(action_id = %action_id, error = %err, "page info unavailable for the target snapshot");
                    (String::new(), String::new())
                }
            },
        };

        Ok(Phase::Acted(Box::new(Acted {
            target,
            executed,
            wait,
            capture,
            assertions,
            proof,
            page,
        })))
    }

    /// Records the acted-on tab (or the tab a spawn opened). A store
    /// failure is logged; the action already happened.
    async fn persist(
        &self,
        handle: &SessionHandle,
        target_id: &TargetId,
        action_id: &ActionId,
        kind: ActionKind,
        acted: &Acted,
    ) {
        let (url, title) = acted.page.clone();
        let snapshot = TargetSnapshot {
            target_id: acted
                .executed
                .target_after
                .clone()
                .unwrap_or_else(|| target_id.clone()),
            session_id: handle.session_id.clone(),
            url,
            title,
            last_action_id: action_id.clone(),
            last_action_kind: kind,
            updated_at: now_ms(),
        };
        if let Err(err) = self.store.save(snapshot).await {
            warn!(action_id = %action_id, error = %err, "target snapshot not persisted");
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::VerbArgs;
    use crate::waiting::WaitSpec;
    use action_gate::{AssertionSpec, EvidenceOptions};
    use action_locator::testing::MatchPage;
    use action_locator::QueryInput;
    use cdp_adapter::testing::{ScriptedTransport, FIXTURE_TARGET};
    use soulact_core_types::SessionSource;
    use soulact_state_center::{InMemoryStateStore, TargetStore};
    use std::time::Duration;

    struct ScriptedConnector(Arc<ScriptedTransport>);

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _config: &CdpConfig) -> Result<Arc<dyn CdpTransport>, AdapterError> {
            let transport: Arc<dyn CdpTransport> = self.0.clone();
            Ok(transport)
        }
    }

    fn pipeline(page: &MatchPage, store: Arc<InMemoryStateStore>) -> ActionPipeline {
        let config = EngineConfig {
            settle_min_ms: 10,
            settle_max_ms: 10,
            ..EngineConfig::default()
        };
        ActionPipeline::new(store, Arc::new(ScriptedConnector(page.transport())), config)
    }

    fn action(report: Report) -> ActionReport {
        match report {
            Report::Action(report) => *report,
            Report::Explain(_) => panic!("expected an action report"),
        }
    }

    #[tokio::test]
    async fn click_reports_pick_and_persists_target() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true, true, true]);
        page.set_page("https://e.test/after", "After");
        let store = Arc::new(InMemoryStateStore::new());
        let request = ActionRequest::new(VerbArgs::Click, QueryInput::text("Buy").with_index(1).visible_only());

        let report = action(pipeline(&page, store.clone()).run(&request).await.unwrap());
        assert_eq!(report.match_count, Some(3));
        assert_eq!(report.picked_index, Some(1));
        assert_eq!(report.session_source, SessionSource::ImplicitNew);
        assert_eq!(report.target_id, TargetId::from(FIXTURE_TARGET));
        assert!(report.wait.is_none() && report.delta.is_none() && report.proof.is_none());

        let targets = store.targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].last_action_kind, ActionKind::Click);
        assert_eq!(targets[0].url, "https://e.test/after");
        assert!(page.transport().is_shut_down());
    }

    #[tokio::test]
    async fn option_errors_precede_any_cdp_call() {
        let page = MatchPage::new(&["MAIN"]);
        let mut request = ActionRequest::new(VerbArgs::Explain, QueryInput::text("Buy"));
        request.evidence = EvidenceOptions {
            delta: true,
            ..EvidenceOptions::default()
        };

        let err = pipeline(&page, Arc::new(InMemoryStateStore::new()))
            .run(&request)
            .await
            .unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::MutuallyExclusive));
        assert!(page.transport().calls().is_empty());
    }

    #[tokio::test]
    async fn query_failure_still_releases_the_session() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        let request = ActionRequest::new(VerbArgs::Click, QueryInput::text("Buy").with_index(99));

        let err = pipeline(&page, Arc::new(InMemoryStateStore::new()))
            .run(&request)
            .await
            .unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::IndexOutOfRange));
        assert_eq!(page.transport().calls_for("Target.detachFromTarget").len(), 1);
        assert!(page.transport().is_shut_down());
    }

    #[tokio::test]
    async fn unknown_target_hint_is_query_invalid() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        let mut request = ActionRequest::new(VerbArgs::Click, QueryInput::text("Buy"));
        request.target = Some("GONE".to_string());

        let err = pipeline(&page, Arc::new(InMemoryStateStore::new()))
            .run(&request)
            .await
            .unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::TargetNotFound));
        assert!(page.transport().calls_for("Target.attachToTarget").is_empty());
        assert!(page.transport().is_shut_down());
    }

    #[tokio::test]
    async fn unknown_session_id_is_query_invalid() {
        let page = MatchPage::new(&["MAIN"]);
        let mut request = ActionRequest::new(VerbArgs::Click, QueryInput::text("Buy"));
        request.session = Some("no-such-session".to_string());

        let err = pipeline(&page, Arc::new(InMemoryStateStore::new()))
            .run(&request)
            .await
            .unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::UnknownSession));
    }

    #[tokio::test]
    async fn failed_assertion_is_reported_after_persisting() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        page.set_page("https://e.test/cart", "Cart");
        let store = Arc::new(InMemoryStateStore::new().with_session("s1", "http://127.0.0.1:9222"));
        let mut request = ActionRequest::new(VerbArgs::Click, QueryInput::text("Buy"));
        request.session = Some("s1".to_string());
        request.assertions = AssertionSpec {
            url_contains: Some("/checkout".to_string()),
            ..AssertionSpec::default()
        };

        let err = pipeline(&page, store.clone()).run(&request).await.unwrap_err();
        assert_eq!(err.code(), "E_ASSERT_FAILED");
        let latest = store.latest_for_session(&"s1".into()).await.unwrap().unwrap();
        assert_eq!(latest.url, "https://e.test/cart");
    }

    #[tokio::test]
    async fn proof_and_wait_are_attached() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true, true]);
        page.on_op("textVisible", |_, _| serde_json::json!({ "found": true }));
        let mut request = ActionRequest::new(VerbArgs::Click, QueryInput::text("Buy"));
        request.wait = WaitSpec {
            text: Some("Added".to_string()),
            ..WaitSpec::default()
        };
        request.timeout = Duration::from_secs(1);
        request.evidence = EvidenceOptions {
            proof: true,
            ..EvidenceOptions::default()
        };

        let report = action(
            pipeline(&page, Arc::new(InMemoryStateStore::new()))
                .run(&request)
                .await
                .unwrap(),
        );
        let wait = report.wait.unwrap();
        assert!(wait.satisfied);
        assert_eq!(wait.mode, "text");
        let proof = report.proof.unwrap();
        assert_eq!(proof.match_count, Some(2));
        assert_eq!(proof.picked_index, Some(0));
        assert_eq!(proof.count_after, Some(2));
        assert_eq!(proof.target_after, TargetId::from(FIXTURE_TARGET));
        assert_eq!(proof.wait_evidence.unwrap()["mode"], "text");
    }

    #[tokio::test]
    async fn explain_returns_envelope_without_persisting() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[false, true]);
        let store = Arc::new(InMemoryStateStore::new());
        let request = ActionRequest::new(VerbArgs::Explain, QueryInput::text("Buy").visible_only());

        let report = pipeline(&page, store.clone()).run(&request).await.unwrap();
        let Report::Explain(envelope) = report else {
            panic!("expected explain");
        };
        assert_eq!(envelope.action, ActionKind::Explain);
        assert_eq!(envelope.report.match_count, 2);
        assert_eq!(envelope.report.picked_index, Some(1));
        assert!(store.targets().is_empty());
        assert!(page.transport().calls_for("Input.dispatchMouseEvent").is_empty());
    }
}
