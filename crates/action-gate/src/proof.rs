//! Action-agnostic proof envelope

use action_locator::{Query, QueryResolver};
use serde::Serialize;
use serde_json::Value;
use soulact_core_types::{AssertionOutcome, TargetId};
use tracing::debug;

use crate::evidence::AfterCapture;

/// Cross-verb record of what an action changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofEnvelope {
    pub url_before: Option<String>,
    pub url_after: Option<String>,
    pub target_before: TargetId,
    pub target_after: TargetId,
    pub match_count: Option<usize>,
    pub picked_index: Option<usize>,
    pub wait_evidence: Option<Value>,
    pub assertions: Option<Vec<AssertionOutcome>>,
    pub count_after: Option<usize>,
    /// Verb-specific extras (download hash, dialog type, spawned target...).
    pub details: Value,
}

/// Inputs gathered by the pipeline for one proof.
#[derive(Debug, Clone, Default)]
pub struct ProofInput {
    pub target_before: TargetId,
    /// Differs from `target_before` only when the verb switched targets.
    pub target_after: Option<TargetId>,
    pub match_count: Option<usize>,
    pub picked_index: Option<usize>,
    pub wait_evidence: Option<Value>,
    pub assertions: Option<Vec<AssertionOutcome>>,
    pub count_after: Option<usize>,
    pub details: Value,
}

impl ProofEnvelope {
    pub fn build(input: ProofInput, capture: &AfterCapture) -> Self {
        let target_after = input
            .target_after
            .unwrap_or_else(|| input.target_before.clone());
        Self {
            url_before: capture.before.as_ref().map(|state| state.url.clone()),
            url_after: capture.after.as_ref().map(|state| state.url.clone()),
            target_before: input.target_before,
            target_after,
            match_count: input.match_count,
            picked_index: input.picked_index,
            wait_evidence: input.wait_evidence,
            assertions: input.assertions,
            count_after: input.count_after,
            details: input.details,
        }
    }
}

/// Re-counts `query` after the action. Failures read as "unknown".
pub async fn count_after(resolver: &QueryResolver<'_>, query: &Query) -> Option<usize> {
    if query.is_handle() {
        return None;
    }
    match resolver.summarize(query).await {
        Ok(index) => Some(index.match_count()),
        Err(err) => {
            debug!(error = %err, "post-action recount failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PageState;
    use action_locator::testing::MatchPage;
    use action_locator::QueryInput;
    use serde_json::json;

    #[test]
    fn proof_keeps_field_order_and_defaults_target_after() {
        let capture = AfterCapture {
            before: Some(PageState {
                url: "https://e.test/a".into(),
                ..PageState::default()
            }),
            after: Some(PageState {
                url: "https://e.test/b".into(),
                ..PageState::default()
            }),
            ..AfterCapture::default()
        };
        let proof = ProofEnvelope::build(
            ProofInput {
                target_before: TargetId::from("T1"),
                match_count: Some(2),
                picked_index: Some(1),
                details: json!({ "method": "cdp" }),
                ..ProofInput::default()
            },
            &capture,
        );
        assert_eq!(proof.target_after.as_str(), "T1");
        let text = serde_json::to_string(&proof).unwrap();
        let positions: Vec<usize> = [
            "urlBefore",
            "urlAfter",
            "targetBefore",
            "targetAfter",
            "matchCount",
            "pickedIndex",
            "waitEvidence",
            "assertions",
            "countAfter",
            "details",
        ]
        .iter()
        .map(|key| text.find(&format!("\"{key}\"")).unwrap())
        .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        let value = serde_json::to_value(&proof).unwrap();
        assert_eq!(value["urlAfter"], "https://e.test/b");
    }

    #[tokio::test]
    async fn count_after_reflects_removed_match() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true, true]);
        let session = page.open().await;
        let resolver = QueryResolver::new(&session);
        let query = action_locator::Query::parse(&QueryInput::text("Delete"))
            .unwrap()
            .unwrap();
        page.remove_match("MAIN", 0);
        assert_eq!(count_after(&resolver, &query).await, Some(1));
    }
}
