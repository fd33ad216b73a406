//! Action executors
//!
//! One executor per verb:
//! 1. click - coordinate click with a synthetic fallback, or click by handle
//! 2. fill - set the value of a fillable match
//! 3. keypress - focus and press a key chord
//! 4. upload - file input or intercepted file chooser, optional verification
//! 5. download - browser download events with an in-page fetch fallback
//! 6. dialog - trigger and answer a JavaScript dialog
//! 7. drag_drop - HTML5 events or a mouse drag between two selectors
//! 8. spawn - click and report the tab it opened

mod click;
mod dialog;
mod download;
mod drag_drop;
mod fill;
mod keypress;
mod spawn;
mod upload;

pub use click::execute_click;
pub use dialog::execute_dialog;
pub use download::{execute_download, sanitize_filename, unique_path};
pub use drag_drop::execute_drag_drop;
pub use fill::execute_fill;
pub use keypress::execute_keypress;
pub use spawn::execute_spawn;
pub use upload::execute_upload;

use action_locator::ops::OpFailure;
use action_locator::Resolution;
use serde::de::DeserializeOwned;
use serde_json::Value;
use soulact_core_types::{ActError, ActResult, FrameCdpId};

use crate::request::PlannedVerb;
use crate::types::{ActionTarget, ExecCtx, Executed};

/// Runs the executor for `verb` against an already resolved target.
pub async fn execute(ctx: &ExecCtx<'_>, verb: &PlannedVerb, target: &ActionTarget) -> ActResult<Executed> {
    match verb {
        PlannedVerb::Click => execute_click(ctx, target).await,
        PlannedVerb::Fill { value } => execute_fill(ctx, target, value).await,
        PlannedVerb::Keypress(chord) => execute_keypress(ctx, target, chord).await,
        PlannedVerb::Upload(plan) => execute_upload(ctx, target, plan).await,
        PlannedVerb::Download(args) => execute_download(ctx, target, args).await,
        PlannedVerb::Dialog(plan) => execute_dialog(ctx, target, plan).await,
        PlannedVerb::DragDrop { source, target } => execute_drag_drop(ctx, source, target).await,
        PlannedVerb::Spawn => execute_spawn(ctx, target).await,
        PlannedVerb::Explain => Err(ActError::internal("execute", "explain has no executor")),
    }
}

/// The resolved match a query-only verb acts on.
pub(crate) fn resolution<'t>(operation: &str, target: &'t ActionTarget) -> ActResult<&'t Resolution> {
    target
        .resolution()
        .ok_or_else(|| ActError::internal(operation, format!("{operation} needs a resolved query")))
}

/// Turns a page-reported failure of an element-addressing op into
/// `E_INTERNAL`; the element was located moments earlier.
pub(crate) fn check_page_failure(operation: &str, value: &Value, frame: &FrameCdpId) -> ActResult<()> {
    match OpFailure::from_value(value) {
        Some(failure) => Err(ActError::internal(
            operation,
            failure
                .message
                .unwrap_or_else(|| format!("{operation} failed in the page")),
        )
        .with_internal_context(|ctx| {
            ctx.frame_id = Some(frame.to_string());
            ctx.detail = failure.error;
        })),
        None => Ok(()),
    }
}

pub(crate) fn decode<T: DeserializeOwned>(operation: &str, value: Value) -> ActResult<T> {
    serde_json::from_value(value)
        .map_err(|err| ActError::internal(operation, format!("malformed {operation} result: {err}")))
}
