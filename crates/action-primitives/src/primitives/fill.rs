//! Fill primitive - set the value of an input, textarea, select or
//! contenteditable match

use action_locator::ops::{self, OpFailure};
use action_locator::QueryResolver;
use serde::Deserialize;
use serde_json::json;
use soulact_core_types::{ActError, ActResult, QueryFailure};
use tracing::info;

use crate::primitives::{check_page_failure, decode, resolution};
use crate::report::{FillOutcome, VerbOutcome};
use crate::types::{ActionTarget, ExecCtx, Executed};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FillResult {
    kind: String,
    tag: String,
    value_after: Option<String>,
    #[serde(default)]
    selector_hint: String,
    #[serde(default)]
    visible: bool,
}

pub async fn execute_fill(ctx: &ExecCtx<'_>, target: &ActionTarget, value: &str) -> ActResult<Executed> {
    let resolution = resolution("fill", target)?;
    let resolver = QueryResolver::new(ctx.session);
    let raw = resolver
        .run_on(resolution, ops::FILL, json!({ "value": value }))
        .await?;

    if let Some(failure) = OpFailure::from_value(&raw) {
        if failure.error.as_deref() == Some("not_fillable") {
            let hint_target = raw["selectorHint"].as_str().unwrap_or_default().to_string();
            return Err(ActError::query(
                QueryFailure::NotFillable,
                failure
                    .message
                    .unwrap_or_else(|| "element is not fillable".to_string()),
            )
            .with_hint("target an input, textarea, select or contenteditable element")
            .with_hint(format!("use explain to list the other {} match(es)", resolution.match_count()))
            .with_query_context(|ctx| {
                ctx.match_count = Some(resolution.match_count());
                ctx.requested_index = resolution.query.index;
                ctx.frame_scope = Some(resolution.query.frame_scope.as_str().to_string());
                if !hint_target.is_empty() {
                    ctx.candidates = vec![soulact_core_types::CandidateHint {
                        index: resolution.picked,
                        frame_id: resolution.frame_id.to_string(),
                        visible: true,
                        text: String::new(),
                        selector_hint: hint_target,
                    }];
                }
            }));
        }
    }
    check_page_failure("fill", &raw, &resolution.frame_id)?;
    let result: FillResult = decode("fill", raw)?;

    info!(
        action_id = %ctx.action_id,
        index = resolution.picked,
        kind = %result.kind,
        "fill applied"
    );
    let outcome = FillOutcome {
        index: resolution.picked,
        frame_id: resolution.frame_id.to_string(),
        kind: result.kind,
        tag: result.tag,
        value_after: result.value_after,
        selector_hint: result.selector_hint,
        visible: result.visible,
    };
    let details = json!({ "kind": outcome.kind, "valueLength": value.chars().count() });
    Ok(Executed::new(VerbOutcome::Filled(outcome)).with_details(details))
}
