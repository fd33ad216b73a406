//! Report shapes written to stdout.
//!
//! Field order is part of the wire contract; optional sections are always
//! present and `null` when not requested.

use std::collections::BTreeMap;

use action_gate::{Delta, PageState, ProofEnvelope};
use action_locator::ops::{ElementPreview, FocusState};
use action_locator::ExplainReport;
use serde::Serialize;
use soulact_core_types::{ActionId, ActionKind, AssertionOutcome, SessionId, SessionSource, TargetId};

use crate::waiting::WaitResult;

/// Milliseconds spent in each invocation phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingMs {
    pub resolve_session: u64,
    pub connect_cdp: u64,
    pub action: u64,
    pub persist_state: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClickMethod {
    /// Mouse events at the element's center.
    Cdp,
    /// In-page `click()`.
    Synthetic,
    /// Mouse events at a backend node's box-model center.
    Handle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickOutcome {
    pub index: Option<usize>,
    pub frame_id: Option<String>,
    pub local_index: Option<usize>,
    pub method: ClickMethod,
    pub backend_node_id: Option<i64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    /// Why the coordinate click was abandoned, when it was.
    pub fallback_reason: Option<String>,
    #[serde(flatten)]
    pub preview: ElementPreview,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FillOutcome {
    pub index: usize,
    pub frame_id: String,
    pub kind: String,
    pub tag: String,
    /// `null` for password inputs.
    pub value_after: Option<String>,
    pub selector_hint: String,
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PressOutcome {
    pub key: String,
    pub code: String,
    pub modifiers: Vec<&'static str>,
    pub index: Option<usize>,
    /// Selector hint of the element focused before the key press.
    pub focused: Option<String>,
    /// Focus after the key press.
    pub active_element: FocusState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    Input,
    Chooser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub path: String,
    pub name: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub mode: &'static str,
    pub value: String,
    pub satisfied: bool,
    pub elapsed_ms: u64,
    pub polls: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub index: usize,
    pub mode: UploadMode,
    pub files: Vec<UploadedFile>,
    pub submitted: bool,
    pub verification: Option<Verification>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMethod {
    /// Browser download events.
    Event,
    /// In-page fetch of the candidate url.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOutcome {
    pub download_started: bool,
    pub method: DownloadMethod,
    pub url: Option<String>,
    pub suggested_filename: Option<String>,
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
    pub status: Option<i64>,
    pub mime_type: Option<String>,
    /// Response headers with credentials redacted.
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogOutcome {
    #[serde(rename = "type")]
    pub dialog_type: String,
    pub message: String,
    pub default_prompt: Option<String>,
    pub url: Option<String>,
    pub accepted: bool,
    pub prompt_text: Option<String>,
    pub triggered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DragMethod {
    /// Synthetic HTML5 drag events.
    Html5,
    /// Mouse press, move and release.
    Mouse,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DragOutcome {
    pub method: DragMethod,
    pub source: String,
    pub target: String,
    pub source_hint: Option<String>,
    pub target_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnDetection {
    Event,
    Scan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOutcome {
    pub target_id: TargetId,
    pub url: String,
    pub title: String,
    pub opener_id: Option<String>,
    pub detected_by: SpawnDetection,
}

/// Verb-specific report section, serialized under its own key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VerbOutcome {
    Clicked(ClickOutcome),
    Filled(FillOutcome),
    Pressed(PressOutcome),
    Uploaded(UploadOutcome),
    Download(DownloadOutcome),
    Dialog(DialogOutcome),
    Dragged(DragOutcome),
    Spawned(SpawnOutcome),
}

/// Successful action report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionReport {
    pub ok: bool,
    pub action: ActionKind,
    pub action_id: ActionId,
    pub session_id: SessionId,
    pub session_source: SessionSource,
    pub target_id: TargetId,
    pub match_count: Option<usize>,
    pub picked_index: Option<usize>,
    #[serde(flatten)]
    pub outcome: VerbOutcome,
    pub wait: Option<WaitResult>,
    pub snapshot: Option<PageState>,
    pub delta: Option<Delta>,
    pub assertions: Option<Vec<AssertionOutcome>>,
    pub proof: Option<ProofEnvelope>,
    pub timing_ms: TimingMs,
}

/// Explain output with the invocation header.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainEnvelope {
    pub ok: bool,
    pub action: ActionKind,
    pub action_id: ActionId,
    pub session_id: SessionId,
    pub session_source: SessionSource,
    pub target_id: TargetId,
    #[serde(flatten)]
    pub report: ExplainReport,
    pub timing_ms: TimingMs,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Report {
    Action(Box<ActionReport>),
    Explain(Box<ExplainEnvelope>),
}

impl Report {
    pub fn timing(&self) -> TimingMs {
        match self {
            Report::Action(report) => report.timing_ms,
            Report::Explain(report) => report.timing_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use action_gate::PageState;

    fn click_report() -> ActionReport {
        ActionReport {
            ok: true,
            action: ActionKind::Click,
            action_id: ActionId::from("a1"),
            session_id: SessionId::from("s1"),
            session_source: SessionSource::Explicit,
            target_id: TargetId::from("T1"),
            match_count: Some(3),
            picked_index: Some(1),
            outcome: VerbOutcome::Clicked(ClickOutcome {
                index: Some(1),
                frame_id: Some("MAIN".into()),
                local_index: Some(1),
                method: ClickMethod::Cdp,
                backend_node_id: None,
                x: Some(20.0),
                y: Some(20.0),
                fallback_reason: None,
                preview: ElementPreview::default(),
            }),
            wait: None,
            snapshot: Some(PageState::default()),
            delta: None,
            assertions: None,
            proof: None,
            timing_ms: TimingMs::default(),
        }
    }

    #[test]
    fn fields_serialize_in_contract_order_with_nulls() {
        let text = serde_json::to_string(&click_report()).unwrap();
        let keys = [
            "\"ok\"",
            "\"action\"",
            "\"actionId\"",
            "\"sessionId\"",
            "\"sessionSource\"",
            "\"targetId\"",
            "\"matchCount\"",
            "\"pickedIndex\"",
            "\"clicked\"",
            "\"wait\"",
            "\"snapshot\"",
            "\"delta\"",
            "\"assertions\"",
            "\"proof\"",
            "\"timingMs\"",
        ];
        let positions: Vec<usize> = keys.iter().map(|key| text.find(key).unwrap()).collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]), "{text}");
        assert!(text.contains("\"wait\":null"));
        assert!(text.contains("\"sessionSource\":\"explicit\""));
        assert!(text.contains("\"action\":\"click\""));
    }

    #[test]
    fn timing_always_has_four_phases() {
        let value = serde_json::to_value(click_report()).unwrap();
        let timing = value["timingMs"].as_object().unwrap();
        assert_eq!(timing.len(), 4);
        for key in ["resolveSession", "connectCdp", "action", "persistState"] {
            assert!(timing.contains_key(key));
        }
    }
}
