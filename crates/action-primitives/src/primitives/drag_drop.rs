//! Drag-and-drop primitive

use action_locator::errors::AdapterResultExt;
use action_locator::ops;
use action_locator::QueryResolver;
use cdp_adapter::input::{self, Point};
use serde::Deserialize;
use serde_json::json;
use soulact_core_types::{ActError, ActResult, FrameCdpId, QueryFailure};
use tracing::info;

use crate::primitives::{check_page_failure, decode};
use crate::report::{DragMethod, DragOutcome, VerbOutcome};
use crate::types::{ExecCtx, Executed};

const MOUSE_STEPS: u32 = 10;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectorState {
    valid: bool,
    message: Option<String>,
    count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectorPoint {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    in_viewport: bool,
    #[serde(default)]
    draggable: bool,
    selector_hint: Option<String>,
}

/// Checks that `selector` parses and matches something in `frame`.
async fn check_selector(
    resolver: &QueryResolver<'_>,
    frame: &FrameCdpId,
    role: &str,
    selector: &str,
) -> ActResult<()> {
    let value = resolver
        .run(frame, ops::SELECTOR_STATE, &json!({ "selector": selector }))
        .await?;
    let state: SelectorState = decode("selector_state", value)?;
    if !state.valid {
        return Err(ActError::query(
            QueryFailure::InvalidSelector,
            format!(
                "invalid {role} selector {selector:?}: {}",
                state.message.unwrap_or_default()
            ),
        )
        .with_hint("check the CSS selector syntax"));
    }
    if state.count == 0 {
        return Err(ActError::query(
            QueryFailure::NoMatch,
            format!("{role} selector {selector:?} matched nothing"),
        )
        .with_hint("drag-drop only searches the main frame")
        .with_query_context(|ctx| {
            ctx.match_count = Some(0);
            ctx.frame_scope = Some("main".to_string());
            ctx.frames_scanned = Some(1);
        }));
    }
    Ok(())
}

async fn selector_point(
    resolver: &QueryResolver<'_>,
    frame: &FrameCdpId,
    selector: &str,
    scroll: bool,
) -> ActResult<SelectorPoint> {
    let value = resolver
        .run(
            frame,
            ops::SELECTOR_POINT,
            &json!({ "selector": selector, "scroll": scroll }),
        )
        .await?;
    check_page_failure("selector_point", &value, frame)?;
    decode("selector_point", value)
}

/// Drags `source` onto `target`, both CSS selectors in the main frame.
///
/// A `draggable` source gets synthetic HTML5 drag events, anything else a
/// stepped mouse drag between the two centers.
pub async fn execute_drag_drop(ctx: &ExecCtx<'_>, source: &str, target: &str) -> ActResult<Executed> {
    let resolver = QueryResolver::new(ctx.session);
    let main = ctx.session.main_frame().or_internal("drag_drop")?;
    check_selector(&resolver, &main, "source", source).await?;
    check_selector(&resolver, &main, "target", target).await?;

    let source_state = selector_point(&resolver, &main, source, true).await?;
    let (method, source_hint, target_hint) = if source_state.draggable {
        let value = resolver
            .run(&main, ops::DRAG_DROP, &json!({ "source": source, "target": target }))
            .await?;
        check_page_failure("drag_drop", &value, &main)?;
        let hint = |side: &str| {
            value[side]["selectorHint"]
                .as_str()
                .filter(|hint| !hint.is_empty())
                .map(str::to_string)
        };
        (DragMethod::Html5, hint("source"), hint("target"))
    } else {
        // Scrolling to the target can move the source, so the source is
        // measured again in place.
        let to = selector_point(&resolver, &main, target, true).await?;
        let from = selector_point(&resolver, &main, source, false).await?;
        for (side, point) in [("source", &from), ("target", &to)] {
            if !point.ok {
                return Err(ActError::internal(
                    "drag_drop",
                    format!("{side} has an empty box and cannot be dragged with the mouse"),
                )
                .with_internal_context(|ctx| ctx.frame_id = Some(main.to_string())));
            }
        }
        if !from.in_viewport {
            return Err(ActError::internal(
                "drag_drop",
                "source and target do not fit in the viewport together",
            )
            .with_hint("enlarge the window or scroll so both elements are visible")
            .with_internal_context(|ctx| ctx.frame_id = Some(main.to_string())));
        }
        input::drag(
            ctx.session,
            Point::new(from.x, from.y),
            Point::new(to.x, to.y),
            MOUSE_STEPS,
        )
        .await
        .or_internal("drag_drop")?;
        (DragMethod::Mouse, from.selector_hint, to.selector_hint)
    };

    info!(action_id = %ctx.action_id, method = ?method, "drag-drop dispatched");
    let outcome = DragOutcome {
        method,
        source: source.to_string(),
        target: target.to_string(),
        source_hint,
        target_hint,
    };
    let details = json!({ "method": outcome.method });
    Ok(Executed::new(VerbOutcome::Dragged(outcome)).with_details(details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EngineConfig;
    use action_locator::testing::MatchPage;
    use soulact_core_types::{ActionId, ActionKind};
    use std::time::Duration;

    async fn run(page: &MatchPage) -> ActResult<Executed> {
        let session = page.open().await;
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            action_id: ActionId::from("a1"),
            kind: ActionKind::DragDrop,
            session: &session,
            config: &config,
            timeout: Duration::from_secs(1),
            monitor: None,
        };
        execute_drag_drop(&ctx, "#card", "#lane").await
    }

    fn both_selectors_match(page: &MatchPage) {
        page.on_op("selectorState", |_, _| json!({ "valid": true, "count": 1, "visibleCount": 1 }));
    }

    #[tokio::test]
    async fn draggable_source_uses_html5_events() {
        let page = MatchPage::new(&["MAIN"]);
        both_selectors_match(&page);
        page.on_op("selectorPoint", |_, _| {
            json!({ "ok": true, "x": 10.0, "y": 10.0, "draggable": true, "selectorHint": "#card" })
        });
        page.on_op("dragDrop", |_, _| {
            json!({ "ok": true, "source": { "selectorHint": "#card" }, "target": { "selectorHint": "#lane" } })
        });

        let executed = run(&page).await.unwrap();
        let VerbOutcome::Dragged(dragged) = executed.outcome else {
            panic!("expected drag outcome");
        };
        assert_eq!(dragged.method, DragMethod::Html5);
        assert_eq!(dragged.target_hint.as_deref(), Some("#lane"));
        assert_eq!(page.op_calls("dragDrop")[0]["source"], "#card");
        assert!(page.transport().calls_for("Input.dispatchMouseEvent").is_empty());
    }

    #[tokio::test]
    async fn plain_elements_use_a_mouse_drag() {
        let page = MatchPage::new(&["MAIN"]);
        both_selectors_match(&page);
        page.on_op("selectorPoint", |_, args| {
            let x = if args["selector"] == "#card" { 10.0 } else { 110.0 };
            json!({ "ok": true, "x": x, "y": 50.0, "inViewport": true, "draggable": false, "selectorHint": args["selector"] })
        });

        let executed = run(&page).await.unwrap();
        let VerbOutcome::Dragged(dragged) = executed.outcome else {
            panic!("expected drag outcome");
        };
        assert_eq!(dragged.method, DragMethod::Mouse);
        let mouse = page.transport().calls_for("Input.dispatchMouseEvent");
        assert_eq!(mouse.first().unwrap().params["x"], 10.0);
        assert_eq!(mouse.last().unwrap().params["type"], "mouseReleased");
        assert_eq!(mouse.last().unwrap().params["x"], 110.0);
        assert!(page.op_calls("dragDrop").is_empty());
    }

    #[tokio::test]
    async fn source_is_measured_after_scrolling_to_target() {
        let page = MatchPage::new(&["MAIN"]);
        both_selectors_match(&page);
        // Source starts at y=100; scrolling the target to the center moves it up by 2900.
        page.on_op("selectorPoint", |_, args| {
            if args["selector"] == "#lane" {
                json!({ "ok": true, "x": 50.0, "y": 400.0, "inViewport": true, "draggable": false })
            } else if args["scroll"] == false {
                json!({ "ok": true, "x": 50.0, "y": 300.0, "inViewport": true, "draggable": false })
            } else {
                json!({ "ok": true, "x": 50.0, "y": 3200.0, "inViewport": true, "draggable": false })
            }
        });

        run(&page).await.unwrap();
        let calls = page.op_calls("selectorPoint");
        let order: Vec<_> = calls
            .iter()
            .map(|args| (args["selector"].as_str().unwrap().to_string(), args["scroll"].as_bool().unwrap()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("#card".to_string(), true),
                ("#lane".to_string(), true),
                ("#card".to_string(), false)
            ]
        );
        let mouse = page.transport().calls_for("Input.dispatchMouseEvent");
        assert_eq!(mouse[1].params["type"], "mousePressed");
        assert_eq!(mouse[1].params["y"], 300.0);
    }

    #[tokio::test]
    async fn source_outside_viewport_is_not_pressed() {
        let page = MatchPage::new(&["MAIN"]);
        both_selectors_match(&page);
        page.on_op("selectorPoint", |_, args| {
            let in_view = args["selector"] == "#lane" || args["scroll"] != false;
            json!({ "ok": true, "x": 50.0, "y": -2500.0, "inViewport": in_view, "draggable": false })
        });

        let err = run(&page).await.unwrap_err();
        assert_eq!(err.code(), "E_INTERNAL");
        assert!(page.transport().calls_for("Input.dispatchMouseEvent").is_empty());
    }

    #[tokio::test]
    async fn unmatched_target_is_query_invalid() {
        let page = MatchPage::new(&["MAIN"]);
        page.on_op("selectorState", |_, args| {
            let count = if args["selector"] == "#card" { 1 } else { 0 };
            json!({ "valid": true, "count": count, "visibleCount": count })
        });
        let err = run(&page).await.unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::NoMatch));
        assert!(err.message().contains("target"));
    }

    #[tokio::test]
    async fn malformed_selector_is_rejected_before_dispatch() {
        let page = MatchPage::new(&["MAIN"]);
        page.on_op("selectorState", |_, _| {
            json!({ "valid": false, "message": "'#' is not a valid selector", "count": 0, "visibleCount": 0 })
        });
        let err = run(&page).await.unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::InvalidSelector));
        assert!(page.op_calls("selectorPoint").is_empty());
    }
}
