//! Keypress primitive

use action_locator::errors::AdapterResultExt;
use action_locator::ops::{self, FocusState};
use action_locator::QueryResolver;
use cdp_adapter::input::{self, MODIFIER_ALT, MODIFIER_CTRL, MODIFIER_META, MODIFIER_SHIFT};
use cdp_adapter::KeyChord;
use serde::Deserialize;
use serde_json::json;
use soulact_core_types::{ActError, ActResult};
use tracing::info;

use crate::primitives::{check_page_failure, decode};
use crate::report::{PressOutcome, VerbOutcome};
use crate::types::{ActionTarget, ExecCtx, Executed};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FocusResult {
    selector_hint: Option<String>,
    #[serde(default)]
    focused: bool,
}

fn modifier_names(mask: u32) -> Vec<&'static str> {
    [
        (MODIFIER_CTRL, "Ctrl"),
        (MODIFIER_ALT, "Alt"),
        (MODIFIER_SHIFT, "Shift"),
        (MODIFIER_META, "Meta"),
    ]
    .into_iter()
    .filter(|(bit, _)| mask & bit != 0)
    .map(|(_, name)| name)
    .collect()
}

/// Focuses the match (or the body), presses the chord, then reads back
/// the focused element.
pub async fn execute_keypress(ctx: &ExecCtx<'_>, target: &ActionTarget, chord: &KeyChord) -> ActResult<Executed> {
    let resolver = QueryResolver::new(ctx.session);
    let (frame, focus) = match target {
        ActionTarget::Query(resolution) => (
            resolution.frame_id.clone(),
            resolver.run_on(resolution, ops::FOCUS, json!({})).await?,
        ),
        ActionTarget::None => {
            let main = ctx.session.main_frame().or_internal("keypress")?;
            let focus = resolver.run(&main, ops::FOCUS, &json!({})).await?;
            (main, focus)
        }
        ActionTarget::Handle(_) => {
            return Err(ActError::internal("keypress", "keypress does not take a handle"))
        }
    };
    check_page_failure("focus", &focus, &frame)?;
    let focus: FocusResult = decode("focus", focus)?;

    input::press_key(ctx.session, chord).await.or_internal("keypress")?;

    let active = resolver.run(&frame, ops::ACTIVE_ELEMENT, &json!({})).await?;
    let active_element: FocusState = decode("active_element", active)?;

    info!(
        action_id = %ctx.action_id,
        key = %chord.key,
        modifiers = chord.modifiers,
        "key pressed"
    );
    let outcome = PressOutcome {
        key: chord.key.clone(),
        code: chord.code.clone(),
        modifiers: modifier_names(chord.modifiers),
        index: target.picked_index(),
        focused: focus.selector_hint.filter(|_| focus.focused),
        active_element,
    };
    let details = json!({ "key": outcome.key, "modifiers": outcome.modifiers });
    Ok(Executed::new(VerbOutcome::Pressed(outcome)).with_details(details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EngineConfig;
    use action_locator::testing::MatchPage;
    use soulact_core_types::{ActionId, ActionKind};
    use std::time::Duration;

    #[test]
    fn modifier_names_follow_fixed_order() {
        assert_eq!(modifier_names(MODIFIER_SHIFT | MODIFIER_CTRL), vec!["Ctrl", "Shift"]);
        assert!(modifier_names(0).is_empty());
    }

    #[tokio::test]
    async fn presses_chord_on_body_without_query() {
        let page = MatchPage::new(&["MAIN"]);
        page.on_op("activeElement", |_, _| {
            json!({ "tag": "input", "selectorHint": "#q", "text": "abc", "textTruncated": false })
        });
        let session = page.open().await;
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            action_id: ActionId::from("a1"),
            kind: ActionKind::Keypress,
            session: &session,
            config: &config,
            timeout: Duration::from_secs(1),
            monitor: None,
        };
        let chord = KeyChord::parse("Ctrl+A").unwrap();

        let executed = execute_keypress(&ctx, &ActionTarget::None, &chord).await.unwrap();
        let VerbOutcome::Pressed(pressed) = executed.outcome else {
            panic!("expected keypress outcome");
        };
        assert_eq!(pressed.key, "A");
        assert_eq!(pressed.modifiers, vec!["Ctrl"]);
        assert_eq!(pressed.focused.as_deref(), Some("body"));
        assert_eq!(pressed.active_element.selector_hint.as_deref(), Some("#q"));

        let keys = page.transport().calls_for("Input.dispatchKeyEvent");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].params["modifiers"], 2);
        assert!(page.op_calls("focus")[0].get("query").is_none());
    }
}
