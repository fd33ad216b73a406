//! Click primitive - coordinate click with a synthetic fallback

use action_locator::errors::{self, AdapterResultExt};
use action_locator::ops::{self, ClickPointResult, ElementPreview, OpFailure};
use action_locator::{QueryResolver, Resolution};
use cdp_adapter::input::{self, Point};
use serde_json::json;
use soulact_core_types::{ActError, ActResult, QueryFailure};
use tracing::{debug, info};

use crate::primitives::{check_page_failure, decode};
use crate::report::{ClickMethod, ClickOutcome, VerbOutcome};
use crate::types::{ActionTarget, ExecCtx, Executed};

/// Execute click primitive
///
/// Query mode:
/// 1. Preview the match and ask the page for its center point
/// 2. Translate the point into main-frame coordinates
/// 3. Dispatch mouse events at that point
/// 4. When no usable point exists, click through the DOM instead
///
/// Handle mode clicks the center of the node's box model.
pub async fn execute_click(ctx: &ExecCtx<'_>, target: &ActionTarget) -> ActResult<Executed> {
    let outcome = match target {
        ActionTarget::Query(resolution) => click_query(ctx, resolution).await?,
        ActionTarget::Handle(node) => click_handle(ctx, *node).await?,
        ActionTarget::None => return Err(ActError::internal("click", "click without a target")),
    };

    info!(
        action_id = %ctx.action_id,
        method = ?outcome.method,
        index = ?outcome.index,
        "click dispatched"
    );
    let details = json!({
        "method": outcome.method,
        "fallbackReason": outcome.fallback_reason,
        "backendNodeId": outcome.backend_node_id,
    });
    Ok(Executed::new(VerbOutcome::Clicked(outcome)).with_details(details))
}

/// Viewport point for a coordinate click, or why there is none. Nothing
/// has been dispatched to the page when this returns.
async fn click_point(
    ctx: &ExecCtx<'_>,
    resolver: &QueryResolver<'_>,
    resolution: &Resolution,
) -> ActResult<Result<Point, String>> {
    let value = resolver.run_on(resolution, ops::CLICK_POINT, json!({})).await?;
    if let Some(failure) = OpFailure::from_value(&value) {
        return Ok(Err(failure
            .message
            .or(failure.error)
            .unwrap_or_else(|| "no click point".to_string())));
    }
    let point: ClickPointResult = decode("click_point", value)?;
    if !point.ok {
        return Ok(Err("element has no clickable geometry".to_string()));
    }
    if point.obscured {
        return Ok(Err("element is covered at its center point".to_string()));
    }
    match ctx.session.frame_offset(&resolution.frame_id).await {
        Ok((dx, dy)) => Ok(Ok(Point::new(point.x, point.y).offset(dx, dy))),
        Err(err) => Ok(Err(format!("frame offset unavailable: {err}"))),
    }
}

async fn click_query(ctx: &ExecCtx<'_>, resolution: &Resolution) -> ActResult<ClickOutcome> {
    let resolver = QueryResolver::new(ctx.session);
    let preview = resolver.preview(resolution).await?;

    let mut outcome = ClickOutcome {
        index: Some(resolution.picked),
        frame_id: Some(resolution.frame_id.to_string()),
        local_index: Some(resolution.local_index),
        method: ClickMethod::Cdp,
        backend_node_id: None,
        x: None,
        y: None,
        fallback_reason: None,
        preview,
    };

    let unavailable = match click_point(ctx, &resolver, resolution).await? {
        Ok(at) => match input::click_at(ctx.session, at).await {
            Ok(()) => {
                outcome.x = Some(at.x);
                outcome.y = Some(at.y);
                None
            }
            Err(failure) if failure.pressed => return Err(errors::internal("click", failure.error)),
            Err(failure) => Some(format!("mouse dispatch failed: {}", failure.error)),
        },
        Err(reason) => Some(reason),
    };

    // The synthetic click only runs while the page has seen no press.
    if let Some(reason) = unavailable {
        debug!(action_id = %ctx.action_id, %reason, "coordinate click unavailable; using synthetic click");
        let value = resolver
            .run_on(resolution, ops::SYNTHETIC_CLICK, json!({}))
            .await?;
        check_page_failure("synthetic_click", &value, &resolution.frame_id)?;
        outcome.preview = decode::<ElementPreview>("synthetic_click", value)?;
        outcome.method = ClickMethod::Synthetic;
        outcome.fallback_reason = Some(reason);
    }
    Ok(outcome)
}

async fn click_handle(ctx: &ExecCtx<'_>, backend_node_id: i64) -> ActResult<ClickOutcome> {
    let at = input::node_center(ctx.session, backend_node_id)
        .await
        .map_err(|err| {
            ActError::query(
                QueryFailure::InvalidHandle,
                format!("node {backend_node_id} cannot be clicked: {err}"),
            )
            .with_hint("handles expire on navigation; look the element up again")
        })?;
    input::click_at(ctx.session, at)
        .await
        .map_err(|failure| failure.error)
        .or_internal("click_handle")?;

    let tag = ctx
        .session
        .send("DOM.describeNode", json!({ "backendNodeId": backend_node_id }))
        .await
        .ok()
        .and_then(|described| described["node"]["localName"].as_str().map(str::to_string))
        .unwrap_or_default();

    Ok(ClickOutcome {
        index: None,
        frame_id: None,
        local_index: None,
        method: ClickMethod::Handle,
        backend_node_id: Some(backend_node_id),
        x: Some(at.x),
        y: Some(at.y),
        fallback_reason: None,
        preview: ElementPreview {
            tag,
            ..ElementPreview::default()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EngineConfig;
    use action_locator::testing::MatchPage;
    use action_locator::{FrameScope, Query, QueryInput};
    use cdp_adapter::{AdapterError, AdapterErrorKind};
    use soulact_core_types::{ActionId, ActionKind};
    use std::time::Duration;

    async fn resolve(page: &MatchPage, input: QueryInput) -> (cdp_adapter::CdpSession, ActionTarget) {
        let session = page.open().await;
        let query = Query::parse(&input).unwrap().unwrap();
        let resolution = QueryResolver::new(&session).resolve(&query).await.unwrap();
        (session, ActionTarget::Query(resolution))
    }

    fn ctx<'a>(session: &'a cdp_adapter::CdpSession, config: &'a EngineConfig) -> ExecCtx<'a> {
        ExecCtx {
            action_id: ActionId::from("a1"),
            kind: ActionKind::Click,
            session,
            config,
            timeout: Duration::from_secs(1),
            monitor: None,
        }
    }

    #[tokio::test]
    async fn clicks_center_point_of_picked_match() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true, true, true]);
        let (session, target) = resolve(&page, QueryInput::text("x").with_index(1).visible_only()).await;
        let config = EngineConfig::default();

        let executed = execute_click(&ctx(&session, &config), &target).await.unwrap();
        let VerbOutcome::Clicked(clicked) = executed.outcome else {
            panic!("expected click outcome");
        };
        assert_eq!(clicked.index, Some(1));
        assert_eq!(clicked.method, ClickMethod::Cdp);
        assert_eq!(clicked.x, Some(20.0));

        let mouse = page.transport().calls_for("Input.dispatchMouseEvent");
        assert_eq!(mouse.len(), 3);
        assert_eq!(mouse[1].params["type"], "mousePressed");
        assert_eq!(mouse[1].params["x"], 20.0);
        assert!(page.op_calls("syntheticClick").is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_synthetic_click_without_geometry() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[false]);
        let (session, target) = resolve(&page, QueryInput::text("x")).await;
        let config = EngineConfig::default();

        let executed = execute_click(&ctx(&session, &config), &target).await.unwrap();
        let VerbOutcome::Clicked(clicked) = executed.outcome else {
            panic!("expected click outcome");
        };
        assert_eq!(clicked.method, ClickMethod::Synthetic);
        assert_eq!(clicked.fallback_reason.as_deref(), Some("element has an empty box"));
        assert!(page.transport().calls_for("Input.dispatchMouseEvent").is_empty());
        assert_eq!(page.op_calls("syntheticClick").len(), 1);
    }

    #[tokio::test]
    async fn rejected_mouse_dispatch_falls_back_before_press() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        page.transport().on_fn("Input.dispatchMouseEvent", |_| {
            Err(AdapterError::new(AdapterErrorKind::Protocol).with_method("Input.dispatchMouseEvent"))
        });
        let (session, target) = resolve(&page, QueryInput::text("x")).await;
        let config = EngineConfig::default();

        let executed = execute_click(&ctx(&session, &config), &target).await.unwrap();
        let VerbOutcome::Clicked(clicked) = executed.outcome else {
            panic!("expected click outcome");
        };
        assert_eq!(clicked.method, ClickMethod::Synthetic);
        assert!(clicked
            .fallback_reason
            .unwrap()
            .starts_with("mouse dispatch failed"));
        assert_eq!(page.op_calls("syntheticClick").len(), 1);
        assert_eq!(clicked.x, None);
    }

    #[tokio::test]
    async fn failure_after_press_is_internal_without_second_click() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true]);
        page.transport().on_fn("Input.dispatchMouseEvent", |params| {
            if params["type"] == "mouseReleased" {
                Err(AdapterError::new(AdapterErrorKind::Protocol).with_method("Input.dispatchMouseEvent"))
            } else {
                Ok(json!({}))
            }
        });
        let (session, target) = resolve(&page, QueryInput::text("x")).await;
        let config = EngineConfig::default();

        let err = execute_click(&ctx(&session, &config), &target).await.unwrap_err();
        assert_eq!(err.code(), "E_INTERNAL");
        assert!(page.op_calls("syntheticClick").is_empty());
    }

    #[tokio::test]
    async fn child_frame_without_owner_box_uses_synthetic_click() {
        let page = MatchPage::new(&["MAIN", "CHILD"]).with_matches("CHILD", &[true]);
        let (session, target) = resolve(&page, QueryInput::text("x").with_scope(FrameScope::All)).await;
        let config = EngineConfig::default();

        let executed = execute_click(&ctx(&session, &config), &target).await.unwrap();
        let VerbOutcome::Clicked(clicked) = executed.outcome else {
            panic!("expected click outcome");
        };
        assert_eq!(clicked.frame_id.as_deref(), Some("CHILD"));
        assert_eq!(clicked.method, ClickMethod::Synthetic);
        assert!(clicked
            .fallback_reason
            .unwrap()
            .starts_with("frame offset unavailable"));
    }

    #[tokio::test]
    async fn handle_click_uses_box_model_center() {
        let page = MatchPage::new(&["MAIN"]);
        page.transport().on(
            "DOM.getBoxModel",
            json!({ "model": {
                "content": [10.0, 10.0, 30.0, 10.0, 30.0, 30.0, 10.0, 30.0],
                "border": [8.0, 8.0, 32.0, 8.0, 32.0, 32.0, 8.0, 32.0]
            }}),
        );
        page.transport()
            .on("DOM.describeNode", json!({ "node": { "backendNodeId": 42, "localName": "button" } }));
        let session = page.open().await;
        let config = EngineConfig::default();

        let executed = execute_click(&ctx(&session, &config), &ActionTarget::Handle(42))
            .await
            .unwrap();
        let VerbOutcome::Clicked(clicked) = executed.outcome else {
            panic!("expected click outcome");
        };
        assert_eq!(clicked.method, ClickMethod::Handle);
        assert_eq!((clicked.x, clicked.y), (Some(20.0), Some(20.0)));
        assert_eq!(clicked.preview.tag, "button");
        assert_eq!(executed.details["backendNodeId"], 42);
    }

    #[tokio::test]
    async fn unknown_handle_is_query_invalid() {
        let page = MatchPage::new(&["MAIN"]);
        let session = page.open().await;
        let config = EngineConfig::default();
        let err = execute_click(&ctx(&session, &config), &ActionTarget::Handle(7))
            .await
            .unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::InvalidHandle));
    }
}
