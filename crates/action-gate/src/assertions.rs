//! Caller assertions evaluated after an action

use action_locator::errors::internal;
use action_locator::ops::{self, PageOp};
use cdp_adapter::CdpSession;
use serde::Deserialize;
use serde_json::{json, Value};
use soulact_core_types::{ActError, ActResult, AssertionOutcome, QueryFailure};
use tracing::debug;

use crate::types::{AssertionSpec, PageState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectorState {
    valid: bool,
    #[serde(default)]
    message: Option<String>,
    count: usize,
    #[serde(default)]
    visible_count: usize,
}

#[derive(Debug, Deserialize)]
struct TextVisible {
    found: bool,
}

impl AssertionSpec {
    /// Rejects option combinations before any CDP call.
    pub fn validate(&self) -> ActResult<()> {
        if self.count.is_some() && self.selector.is_none() {
            return Err(ActError::query(
                QueryFailure::InvalidOptions,
                "--assert-count requires --assert-selector",
            )
            .with_hint("add --assert-selector <css> naming the elements to count")
            .with_query_context(|ctx| ctx.conflicting = vec!["--assert-count".to_string()]));
        }
        for (flag, value) in [
            ("--assert-url-contains", &self.url_contains),
            ("--assert-title-contains", &self.title_contains),
            ("--assert-text", &self.text),
            ("--assert-selector", &self.selector),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(ActError::query(
                    QueryFailure::InvalidOptions,
                    format!("{flag} must not be empty"),
                ));
            }
        }
        Ok(())
    }
}

async fn run_main(session: &CdpSession, op: PageOp, args: Value) -> ActResult<Value> {
    let main = session
        .main_frame()
        .map_err(|err| internal("assert", err))?;
    session
        .evaluate(&main, &op.expression(&args))
        .await
        .map_err(|err| internal("assert", err))
}

fn malformed(op: &str, err: serde_json::Error) -> ActError {
    ActError::internal("assert", format!("malformed {op} result: {err}"))
}

/// Evaluates every requested assertion against the post-action page.
///
/// Returns all outcomes, passed or not; [`check`] turns failures into
/// `E_ASSERT_FAILED`.
pub async fn evaluate(
    session: &CdpSession,
    spec: &AssertionSpec,
    after: &PageState,
) -> ActResult<Vec<AssertionOutcome>> {
    let mut outcomes = Vec::new();

    if let Some(needle) = &spec.url_contains {
        outcomes.push(AssertionOutcome {
            name: "url_contains".into(),
            expected: json!(needle),
            actual: json!(after.url),
            passed: after.url.contains(needle.as_str()),
        });
    }
    if let Some(needle) = &spec.title_contains {
        outcomes.push(AssertionOutcome {
            name: "title_contains".into(),
            expected: json!(needle),
            actual: json!(after.title),
            passed: after.title.contains(needle.as_str()),
        });
    }
    if let Some(text) = &spec.text {
        let value = run_main(session, ops::TEXT_VISIBLE, json!({ "text": text })).await?;
        let visible: TextVisible =
            serde_json::from_value(value).map_err(|err| malformed("textVisible", err))?;
        outcomes.push(AssertionOutcome {
            name: "text".into(),
            expected: json!(text),
            actual: json!(visible.found),
            passed: visible.found,
        });
    }
    if let Some(selector) = &spec.selector {
        let value = run_main(session, ops::SELECTOR_STATE, json!({ "selector": selector })).await?;
        let state: SelectorState =
            serde_json::from_value(value).map_err(|err| malformed("selectorState", err))?;
        if !state.valid {
            return Err(ActError::query(
                QueryFailure::InvalidSelector,
                format!(
                    "--assert-selector is not a valid CSS selector: {}",
                    state.message.unwrap_or_default()
                ),
            )
            .with_hint("fix the --assert-selector syntax"));
        }
        match spec.count {
            Some(expected) => outcomes.push(AssertionOutcome {
                name: "count".into(),
                expected: json!({ "selector": selector, "count": expected }),
                actual: json!(state.count),
                passed: state.count == expected,
            }),
            None => outcomes.push(AssertionOutcome {
                name: "selector".into(),
                expected: json!(selector),
                actual: json!({ "count": state.count, "visibleCount": state.visible_count }),
                passed: state.count > 0,
            }),
        }
    }

    debug!(
        total = outcomes.len(),
        failed = outcomes.iter().filter(|o| !o.passed).count(),
        "assertions evaluated"
    );
    Ok(outcomes)
}

/// `E_ASSERT_FAILED` listing every failed outcome, if any failed.
pub fn check(outcomes: &[AssertionOutcome]) -> ActResult<()> {
    let failed: Vec<AssertionOutcome> = outcomes.iter().filter(|o| !o.passed).cloned().collect();
    if failed.is_empty() {
        return Ok(());
    }
    Err(ActError::assert_failed(outcomes.len(), failed)
        .with_hint("inspect hintContext.failed for expected and actual values"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use action_locator::testing::MatchPage;

    fn after(url: &str, title: &str) -> PageState {
        PageState {
            url: url.into(),
            title: title.into(),
            ..PageState::default()
        }
    }

    #[test]
    fn count_needs_selector() {
        let spec = AssertionSpec {
            count: Some(2),
            ..AssertionSpec::default()
        };
        let err = spec.validate().unwrap_err();
        assert_eq!(err.code(), "E_QUERY_INVALID");
        assert_eq!(err.query_reason(), Some(QueryFailure::InvalidOptions));
    }

    #[tokio::test]
    async fn url_and_title_use_after_state() {
        let page = MatchPage::new(&["MAIN"]);
        let session = page.open().await;
        let spec = AssertionSpec {
            url_contains: Some("/done".into()),
            title_contains: Some("Cart".into()),
            ..AssertionSpec::default()
        };
        let outcomes = evaluate(&session, &spec, &after("https://e.test/done", "Home"))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].passed);
        assert!(!outcomes[1].passed);

        let err = check(&outcomes).unwrap_err();
        assert_eq!(err.code(), "E_ASSERT_FAILED");
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn selector_count_compares_exactly() {
        let page = MatchPage::new(&["MAIN"]);
        page.on_op("selectorState", |_, _| json!({ "valid": true, "count": 3, "visibleCount": 2 }));
        let session = page.open().await;
        let spec = AssertionSpec {
            selector: Some("li.item".into()),
            count: Some(3),
            ..AssertionSpec::default()
        };
        let outcomes = evaluate(&session, &spec, &PageState::default()).await.unwrap();
        assert_eq!(outcomes[0].name, "count");
        assert!(outcomes[0].passed);
        assert!(check(&outcomes).is_ok());
    }

    #[tokio::test]
    async fn invalid_assert_selector_is_query_invalid() {
        let page = MatchPage::new(&["MAIN"]);
        page.on_op("selectorState", |_, _| {
            json!({ "valid": false, "message": "'##' is not a valid selector", "count": 0, "visibleCount": 0 })
        });
        let session = page.open().await;
        let spec = AssertionSpec {
            selector: Some("##".into()),
            ..AssertionSpec::default()
        };
        let err = evaluate(&session, &spec, &PageState::default()).await.unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::InvalidSelector));
    }

    #[tokio::test]
    async fn text_assertion_reads_page() {
        let page = MatchPage::new(&["MAIN"]);
        page.on_op("textVisible", |_, args| json!({ "found": args["text"] == "Saved" }));
        let session = page.open().await;
        let spec = AssertionSpec {
            text: Some("Saved".into()),
            ..AssertionSpec::default()
        };
        let outcomes = evaluate(&session, &spec, &PageState::default()).await.unwrap();
        assert!(outcomes[0].passed);
        assert_eq!(outcomes[0].actual, json!(true));
    }
}
