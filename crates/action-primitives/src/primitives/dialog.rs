//! Dialog primitive - answer the next JavaScript dialog, optionally
//! triggering it with a click

use action_locator::errors::AdapterResultExt;
use cdp_adapter::Domain;
use serde_json::json;
use soulact_core_types::{ActError, ActResult, WaitContext, WaitPhase};
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::primitives::execute_click;
use crate::report::{DialogOutcome, VerbOutcome};
use crate::request::DialogPlan;
use crate::types::{ActionTarget, ExecCtx, Executed};

/// Races `Page.javascriptDialogOpening` against the trigger click.
///
/// A dialog blocks the renderer, so the click's mouse events may not be
/// answered until the dialog is handled; the click keeps running while we
/// wait for the event and is awaited again afterwards.
pub async fn execute_dialog(ctx: &ExecCtx<'_>, target: &ActionTarget, plan: &DialogPlan) -> ActResult<Executed> {
    let session = ctx.session;
    let mut events = session.events();
    session.enable(Domain::Page).await.or_internal("dialog")?;

    let started = Instant::now();
    let triggered = !matches!(target, ActionTarget::None);
    let trigger = async {
        if triggered {
            execute_click(ctx, target).await.map(Some)
        } else {
            Ok(None)
        }
    };
    tokio::pin!(trigger);
    let opening = events.wait_for("Page.javascriptDialogOpening", ctx.timeout, |_| true);
    tokio::pin!(opening);

    let mut clicked = None;
    let event = loop {
        tokio::select! {
            event = &mut opening => break event,
            result = &mut trigger, if clicked.is_none() => {
                clicked = Some(result?);
            }
        }
    };

    let Some(event) = event else {
        let mut err = ActError::wait_timeout(
            WaitContext {
                phase: WaitPhase::DialogEvent,
                mode: Some("dialog".to_string()),
                timeout_ms: ctx.timeout.as_millis() as u64,
                elapsed_ms: started.elapsed().as_millis() as u64,
                ..WaitContext::default()
            },
            format!("no dialog opened within {}ms", ctx.timeout.as_millis()),
        );
        if !triggered {
            err = err.with_hint("pass a query to click the element that opens the dialog");
        }
        return Err(err.with_hint("increase --timeout if the dialog opens late"));
    };

    let params = &event.params;
    let dialog_type = params["type"].as_str().unwrap_or("alert").to_string();
    let prompt_text = plan.prompt_text.clone().filter(|_| dialog_type == "prompt" && plan.accept);
    let mut answer = json!({ "accept": plan.accept });
    if let Some(text) = &prompt_text {
        answer["promptText"] = json!(text);
    }
    session
        .send("Page.handleJavaScriptDialog", answer)
        .await
        .or_internal("dialog")?;

    if triggered && clicked.is_none() {
        let remaining = ctx.timeout.saturating_sub(started.elapsed());
        match timeout(remaining, &mut trigger).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => debug!(action_id = %ctx.action_id, error = %err, "trigger click failed after the dialog was answered"),
            Err(_) => debug!(action_id = %ctx.action_id, "trigger click still pending after the dialog was answered"),
        }
    }

    info!(
        action_id = %ctx.action_id,
        dialog_type = %dialog_type,
        accepted = plan.accept,
        "dialog answered"
    );
    let outcome = DialogOutcome {
        dialog_type,
        message: params["message"].as_str().unwrap_or_default().to_string(),
        default_prompt: params["defaultPrompt"]
            .as_str()
            .filter(|prompt| !prompt.is_empty())
            .map(str::to_string),
        url: params["url"].as_str().map(str::to_string),
        accepted: plan.accept,
        prompt_text,
        triggered,
    };
    let details = json!({ "type": outcome.dialog_type, "accepted": outcome.accepted });
    Ok(Executed::new(VerbOutcome::Dialog(outcome)).with_details(details))
}
