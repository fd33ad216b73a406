//! Spawn primitive - click and report the tab it opened

use std::collections::HashSet;

use action_locator::errors::AdapterResultExt;
use cdp_adapter::{list_pages, EventStream, TargetInfo};
use serde_json::json;
use soulact_core_types::{ActError, ActResult, TargetId, WaitContext, WaitPhase};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::primitives::execute_click;
use crate::report::{SpawnDetection, SpawnOutcome, VerbOutcome};
use crate::types::{ActionTarget, ExecCtx, Executed};

fn opened_by(info: &TargetInfo, opener: &TargetId) -> bool {
    info.opener_id.as_ref() == Some(opener)
}

async fn detect_spawn(
    ctx: &ExecCtx<'_>,
    target: &ActionTarget,
    events: &mut EventStream,
    before: &HashSet<TargetId>,
) -> ActResult<(TargetInfo, SpawnDetection)> {
    let transport = ctx.session.transport();
    let opener = ctx.session.target_id().clone();
    let started = Instant::now();
    execute_click(ctx, target).await?;

    let created = events
        .wait_for("Target.targetCreated", ctx.timeout, |event| {
            TargetInfo::from_value(&event.params["targetInfo"])
                .map(|info| info.is_page() && opened_by(&info, &opener) && !before.contains(&info.target_id))
                .unwrap_or(false)
        })
        .await;
    if let Some(event) = created {
        let info = TargetInfo::from_value(&event.params["targetInfo"]).or_internal("spawn")?;
        return Ok((info, SpawnDetection::Event));
    }

    debug!(action_id = %ctx.action_id, "no targetCreated event; scanning open pages");
    let mut fresh: Vec<TargetInfo> = list_pages(transport.as_ref())
        .await
        .or_internal("spawn")?
        .into_iter()
        .filter(|info| !before.contains(&info.target_id))
        .collect();
    fresh.sort_by_key(|info| !opened_by(info, &opener));
    match fresh.into_iter().next() {
        Some(info) => Ok((info, SpawnDetection::Scan)),
        None => Err(ActError::wait_timeout(
            WaitContext {
                phase: WaitPhase::SpawnEvent,
                mode: Some("page".to_string()),
                timeout_ms: ctx.timeout.as_millis() as u64,
                elapsed_ms: started.elapsed().as_millis() as u64,
                ..WaitContext::default()
            },
            format!("no new tab opened within {}ms", ctx.timeout.as_millis()),
        )
        .with_hint("check that the element opens a new tab or window (target=_blank, window.open)")
        .with_hint("increase --timeout if the tab opens late")),
    }
}

pub async fn execute_spawn(ctx: &ExecCtx<'_>, target: &ActionTarget) -> ActResult<Executed> {
    let session = ctx.session;
    let before: HashSet<TargetId> = list_pages(session.transport().as_ref())
        .await
        .or_internal("spawn")?
        .into_iter()
        .map(|info| info.target_id)
        .collect();

    let mut events = session.events();
    session
        .send_browser("Target.setDiscoverTargets", json!({ "discover": true }))
        .await
        .or_internal("spawn")?;

    let detected = detect_spawn(ctx, target, &mut events, &before).await;

    // Discovery is switched off again on every path.
    if let Err(err) = session
        .send_browser("Target.setDiscoverTargets", json!({ "discover": false }))
        .await
    {
        debug!(error = %err, "failed to stop target discovery");
    }
    let (spawned, detected_by) = detected?;

    info!(
        action_id = %ctx.action_id,
        target_id = %spawned.target_id,
        detected_by = ?detected_by,
        "new tab detected"
    );
    let outcome = SpawnOutcome {
        target_id: spawned.target_id.clone(),
        url: spawned.url,
        title: spawned.title,
        opener_id: spawned.opener_id.map(|id| id.to_string()),
        detected_by,
    };
    let details = json!({ "targetId": outcome.target_id, "detectedBy": outcome.detected_by });
    let mut executed = Executed::new(VerbOutcome::Spawned(outcome)).with_details(details);
    executed.target_after = Some(spawned.target_id);
    Ok(executed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EngineConfig;
    use action_locator::testing::MatchPage;
    use action_locator::{Query, QueryInput, QueryResolver};
    use cdp_adapter::testing::{browser_event, FIXTURE_TARGET};
    use cdp_adapter::{AdapterError, AdapterErrorKind};
    use soulact_core_types::{ActionId, ActionKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn page_info(id: &str, opener: Option<&str>) -> serde_json::Value {
        json!({
            "targetId": id,
            "type": "page",
            "title": "",
            "url": format!("https://e.test/{id}"),
            "attached": false,
            "openerId": opener,
        })
    }

    async fn run(page: &MatchPage, wait: Duration) -> ActResult<Executed> {
        let session = page.open().await;
        let query = Query::parse(&QueryInput::text("Open")).unwrap().unwrap();
        let resolution = QueryResolver::new(&session).resolve(&query).await.unwrap();
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            action_id: ActionId::from("a1"),
            kind: ActionKind::Spawn,
            session: &session,
            config: &config,
            timeout: wait,
            monitor: None,
        };
        execute_spawn(&ctx, &ActionTarget::Query(resolution)).await
    }

    #[tokio::test]
    async fn reports_tab_from_target_created_event() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        page.transport()
            .on("Target.getTargets", json!({ "targetInfos": [page_info(FIXTURE_TARGET, None)] }));
        page.transport().emit_after(
            "Input.dispatchMouseEvent",
            browser_event(
                "Target.targetCreated",
                json!({ "targetInfo": page_info("OTHER", Some("SOMEONE-ELSE")) }),
            ),
        );
        page.transport().emit_after(
            "Input.dispatchMouseEvent",
            browser_event(
                "Target.targetCreated",
                json!({ "targetInfo": page_info("P2", Some(FIXTURE_TARGET)) }),
            ),
        );

        let executed = run(&page, Duration::from_secs(2)).await.unwrap();
        assert_eq!(executed.target_after, Some(TargetId::from("P2")));
        let VerbOutcome::Spawned(spawned) = executed.outcome else {
            panic!("expected spawn outcome");
        };
        assert_eq!(spawned.detected_by, SpawnDetection::Event);
        assert_eq!(spawned.opener_id.as_deref(), Some(FIXTURE_TARGET));
        assert_eq!(spawned.url, "https://e.test/P2");
    }

    #[tokio::test]
    async fn falls_back_to_scanning_open_pages() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        let listed = Arc::new(AtomicUsize::new(0));
        let counter = listed.clone();
        page.transport().on_fn("Target.getTargets", move |_| {
            let mut infos = vec![page_info(FIXTURE_TARGET, None)];
            if counter.fetch_add(1, Ordering::SeqCst) > 0 {
                infos.push(page_info("P3", Some(FIXTURE_TARGET)));
            }
            Ok(json!({ "targetInfos": infos }))
        });

        let executed = run(&page, Duration::from_millis(150)).await.unwrap();
        assert_eq!(executed.target_after, Some(TargetId::from("P3")));
        let VerbOutcome::Spawned(spawned) = executed.outcome else {
            panic!("expected spawn outcome");
        };
        assert_eq!(spawned.detected_by, SpawnDetection::Scan);
        assert_eq!(listed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_new_tab_times_out() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        page.transport()
            .on("Target.getTargets", json!({ "targetInfos": [page_info(FIXTURE_TARGET, None)] }));

        let err = run(&page, Duration::from_millis(300)).await.unwrap_err();
        match err {
            ActError::WaitTimeout { context, .. } => assert_eq!(context.phase, WaitPhase::SpawnEvent),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_is_switched_off_after_failures() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        page.transport()
            .on("Target.getTargets", json!({ "targetInfos": [page_info(FIXTURE_TARGET, None)] }));
        run(&page, Duration::from_millis(300)).await.unwrap_err();

        let discover: Vec<_> = page
            .transport()
            .calls_for("Target.setDiscoverTargets")
            .iter()
            .map(|call| call.params["discover"].as_bool().unwrap())
            .collect();
        assert_eq!(discover, vec![true, false]);

        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        page.transport()
            .on("Target.getTargets", json!({ "targetInfos": [page_info(FIXTURE_TARGET, None)] }));
        page.transport().on_fn("Input.dispatchMouseEvent", |params| {
            if params["type"] == "mouseReleased" {
                Err(AdapterError::new(AdapterErrorKind::Protocol))
            } else {
                Ok(json!({}))
            }
        });
        let err = run(&page, Duration::from_millis(300)).await.unwrap_err();
        assert_eq!(err.code(), "E_INTERNAL");
        let last = page.transport().calls_for("Target.setDiscoverTargets");
        assert_eq!(last.last().unwrap().params["discover"], false);
    }
}
