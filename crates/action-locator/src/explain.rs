//! Dry-run of the selection policy.

use serde::Serialize;
use soulact_core_types::{ActError, ActResult, FrameCdpId, QueryFailure};
use tracing::debug;

use crate::frame_index::FrameSummary;
use crate::ops::ElementPreview;
use crate::resolver::{select, Pick, QueryResolver, Resolution};
use crate::types::Query;

/// Cap on the rejected list.
pub const REJECTED_CAP: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainPick {
    pub index: usize,
    pub frame_id: FrameCdpId,
    pub local_index: usize,
    #[serde(flatten)]
    pub preview: ElementPreview,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub index: usize,
    pub frame_id: String,
    pub reason: &'static str,
    pub visible: bool,
    pub text: String,
    pub selector_hint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainReport {
    pub match_count: usize,
    pub requested_index: Option<usize>,
    pub picked_index: Option<usize>,
    pub picked: Option<ExplainPick>,
    pub rejected: Vec<Rejection>,
    pub rejected_truncated: bool,
    /// `picked`, or the selection failure code.
    pub reason: String,
    pub visible_only: bool,
    pub frame_scope: &'static str,
    pub frames: Vec<FrameSummary>,
}

/// Explains how `query` would be resolved without touching the page.
///
/// Selection failures are reported in `reason` rather than raised; only
/// malformed queries and protocol failures are errors.
pub async fn explain(resolver: &QueryResolver<'_>, query: &Query) -> ActResult<ExplainReport> {
    if query.is_handle() {
        return Err(ActError::query(
            QueryFailure::MutuallyExclusive,
            "explain does not accept --handle",
        )
        .with_hint("explain a --text, --selector or --contains query instead")
        .with_query_context(|ctx| ctx.conflicting = vec!["--handle".to_string()]));
    }

    let index = resolver.summarize(query).await?;
    let mut reason = "picked".to_string();
    let mut picked: Option<ExplainPick> = None;

    match select(&index, query.index, query.visible_only) {
        Ok(pick) => {
            let global = pick.index();
            let (frame_id, local_index) = index.locate(global).ok_or_else(|| {
                ActError::internal("explain", format!("global index {global} does not map to a frame"))
            })?;
            let resolution = Resolution {
                query: query.clone(),
                index: index.clone(),
                picked: global,
                frame_id: frame_id.clone(),
                local_index,
            };
            let preview = resolver.preview(&resolution).await?;
            if matches!(pick, Pick::CheckVisible(_)) && !preview.visible {
                reason = QueryFailure::NotVisibleAtIndex.as_str().to_string();
            } else {
                picked = Some(ExplainPick {
                    index: global,
                    frame_id,
                    local_index,
                    preview,
                });
            }
        }
        Err(failure) => reason = failure.as_str().to_string(),
    }

    let picked_index = picked.as_ref().map(|pick| pick.index);

    // One extra slot for a hidden picked element.
    let (hidden, hidden_total) = resolver
        .candidates(query, &index, REJECTED_CAP + 1, true)
        .await?;
    let rejected: Vec<Rejection> = hidden
        .into_iter()
        .filter(|candidate| Some(candidate.index) != picked_index)
        .take(REJECTED_CAP)
        .map(|candidate| Rejection {
            index: candidate.index,
            frame_id: candidate.frame_id,
            reason: "not_visible",
            visible: candidate.visible,
            text: candidate.text,
            selector_hint: candidate.selector_hint,
        })
        .collect();

    debug!(
        match_count = index.match_count(),
        picked = ?picked_index,
        hidden = hidden_total,
        reason = %reason,
        "explain finished"
    );

    Ok(ExplainReport {
        match_count: index.match_count(),
        requested_index: query.index,
        picked_index,
        picked,
        rejected,
        rejected_truncated: hidden_total > REJECTED_CAP,
        reason,
        visible_only: query.visible_only,
        frame_scope: query.frame_scope.as_str(),
        frames: index.summaries().cloned().collect(),
    })
}
