//! Multi-frame query resolution and the selection policy

use cdp_adapter::{AdapterError, CdpSession, RemoteObjectId};
use futures::future::join_all;
use serde_json::{json, Value};
use soulact_core_types::{ActError, ActResult, CandidateHint, FrameCdpId, QueryFailure};
use tracing::{debug, warn};

use crate::errors::{internal, internal_in_frame};
use crate::frame_index::{FrameIndex, FrameSummary};
use crate::ops::{self, CandidatesResult, ElementPreview, OpFailure, PageOp, SummaryResult};
use crate::types::{FrameScope, Query};

/// Candidate previews attached to query failures.
const FAILURE_CANDIDATES: usize = 3;

/// Outcome of the synchronous part of the selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// Final pick.
    Index(usize),
    /// Explicit index under `visibleOnly`; the element's visibility decides.
    CheckVisible(usize),
}

impl Pick {
    pub fn index(&self) -> usize {
        match self {
            Pick::Index(index) | Pick::CheckVisible(index) => *index,
        }
    }
}

/// Applies the selection policy to a frame index.
pub fn select(
    index: &FrameIndex,
    requested: Option<usize>,
    visible_only: bool,
) -> Result<Pick, QueryFailure> {
    if index.match_count() == 0 {
        return Err(if visible_only {
            QueryFailure::NoVisibleMatch
        } else {
            QueryFailure::NoMatch
        });
    }
    if let Some(requested) = requested {
        if requested >= index.match_count() {
            return Err(QueryFailure::IndexOutOfRange);
        }
        return Ok(if visible_only {
            Pick::CheckVisible(requested)
        } else {
            Pick::Index(requested)
        });
    }
    if !visible_only {
        return Ok(Pick::Index(0));
    }
    index
        .first_visible()
        .map(Pick::Index)
        .ok_or(QueryFailure::NoVisibleMatch)
}

/// The single element a query resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub query: Query,
    pub index: FrameIndex,
    pub picked: usize,
    pub frame_id: FrameCdpId,
    pub local_index: usize,
}

impl Resolution {
    pub fn match_count(&self) -> usize {
        self.index.match_count()
    }

    /// `{query, index}` argument for element-addressing operations.
    pub fn op_args(&self) -> Value {
        json!({ "query": ops::query_arg(&self.query), "index": self.local_index })
    }
}

enum FrameOutcome {
    Summary(FrameSummary),
    InvalidSelector(String),
    Failed(AdapterError),
}

/// Resolves queries against the frames of one session.
pub struct QueryResolver<'a> {
    session: &'a CdpSession,
}

impl<'a> QueryResolver<'a> {
    pub fn new(session: &'a CdpSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &'a CdpSession {
        self.session
    }

    /// Frames a scope covers, in frame-tree order.
    pub fn frames_for_scope(&self, scope: FrameScope) -> Vec<FrameCdpId> {
        match scope {
            FrameScope::Main => self.session.frames().main().map(|node| node.id.clone()).into_iter().collect(),
            FrameScope::All => self.session.frames().ids(),
        }
    }

    /// Runs an operation in `frame` and returns its raw result.
    pub async fn run(&self, frame: &FrameCdpId, op: PageOp, args: &Value) -> ActResult<Value> {
        self.session
            .evaluate(frame, &op.expression(args))
            .await
            .map_err(|err| internal_in_frame(op.name, frame, err))
    }

    /// Runs an element-addressing operation against the resolved match.
    /// Page-reported failures surface as `E_INTERNAL` since the match was
    /// located a moment earlier.
    pub async fn run_on(&self, resolution: &Resolution, op: PageOp, extra: Value) -> ActResult<Value> {
        let mut args = resolution.op_args();
        if let (Some(target), Some(extra)) = (args.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }
        self.run(&resolution.frame_id, op, &args).await
    }

    /// Per-frame summaries for the query's scope, evaluated concurrently.
    pub async fn summarize(&self, query: &Query) -> ActResult<FrameIndex> {
        if query.is_handle() {
            return Err(ActError::internal(
                "summary",
                "handle queries are not resolved through frame summaries",
            ));
        }
        let frames = self.frames_for_scope(query.frame_scope);
        let main = self.session.main_frame().map_err(|err| internal("summary", err))?;
        let args = json!({ "query": ops::query_arg(query) });

        let outcomes = join_all(frames.iter().map(|frame| self.summarize_frame(frame, &args))).await;

        let mut summaries = Vec::with_capacity(frames.len());
        for (frame, outcome) in frames.iter().zip(outcomes) {
            match outcome {
                FrameOutcome::Summary(summary) => summaries.push(summary),
                FrameOutcome::InvalidSelector(message) => {
                    return Err(ActError::query(
                        QueryFailure::InvalidSelector,
                        format!("invalid selector {:?}: {message}", query.raw_query),
                    )
                    .with_hint("fix the CSS selector syntax")
                    .with_hint("use --text or --contains to match by visible text")
                    .with_query_context(|ctx| {
                        ctx.frame_scope = Some(query.frame_scope.as_str().to_string());
                    }));
                }
                FrameOutcome::Failed(err) if *frame == main => {
                    return Err(internal_in_frame("summary", frame, err));
                }
                FrameOutcome::Failed(err) => {
                    warn!(frame_id = %frame, error = %err, "frame skipped during query resolution");
                    summaries.push(FrameSummary::skipped(frame.clone()));
                }
            }
        }

        let index = FrameIndex::new(summaries);
        debug!(
            query = %query.describe(),
            scope = query.frame_scope.as_str(),
            match_count = index.match_count(),
            frames = index.frames_scanned(),
            "query summarized"
        );
        Ok(index)
    }

    async fn summarize_frame(&self, frame: &FrameCdpId, args: &Value) -> FrameOutcome {
        let value = match self
            .session
            .evaluate(frame, &ops::SUMMARY.expression(args))
            .await
        {
            Ok(value) => value,
            Err(err) => return FrameOutcome::Failed(err),
        };
        if let Some(failure) = OpFailure::from_value(&value) {
            if failure.is_invalid_selector() {
                return FrameOutcome::InvalidSelector(failure.message.unwrap_or_default());
            }
        }
        match serde_json::from_value::<SummaryResult>(value) {
            Ok(result) => FrameOutcome::Summary(FrameSummary {
                frame_id: frame.clone(),
                raw_count: result.raw_count,
                first_visible_index: result.first_visible_index,
                visible_count: result.visible_count,
                skipped: false,
            }),
            Err(err) => FrameOutcome::Failed(
                AdapterError::new(cdp_adapter::AdapterErrorKind::Internal)
                    .with_hint(format!("malformed summary: {err}")),
            ),
        }
    }

    /// Resolves a query to exactly one element per the selection policy.
    pub async fn resolve(&self, query: &Query) -> ActResult<Resolution> {
        let index = self.summarize(query).await?;
        let pick = match select(&index, query.index, query.visible_only) {
            Ok(pick) => pick,
            Err(reason) => return Err(self.selection_failure(query, &index, reason).await),
        };

        let picked = pick.index();
        let (frame_id, local_index) = index.locate(picked).ok_or_else(|| {
            ActError::internal(
                "resolve",
                format!("global index {picked} does not map to a frame"),
            )
        })?;
        let resolution = Resolution {
            query: query.clone(),
            index,
            picked,
            frame_id,
            local_index,
        };

        if let Pick::CheckVisible(_) = pick {
            let preview = self.preview(&resolution).await?;
            if !preview.visible {
                return Err(self
                    .selection_failure(query, &resolution.index, QueryFailure::NotVisibleAtIndex)
                    .await);
            }
        }

        debug!(
            picked = resolution.picked,
            frame_id = %resolution.frame_id,
            local_index = resolution.local_index,
            "query resolved"
        );
        Ok(resolution)
    }

    /// Preview of the resolved element.
    pub async fn preview(&self, resolution: &Resolution) -> ActResult<ElementPreview> {
        let value = self.run(&resolution.frame_id, ops::PREVIEW, &resolution.op_args()).await?;
        if let Some(failure) = OpFailure::from_value(&value) {
            return Err(ActError::internal(
                "preview",
                failure
                    .message
                    .unwrap_or_else(|| "matched element disappeared".to_string()),
            )
            .with_internal_context(|ctx| ctx.frame_id = Some(resolution.frame_id.to_string())));
        }
        serde_json::from_value(value)
            .map_err(|err| ActError::internal("preview", format!("malformed preview: {err}")))
    }

    /// Remote handle of the resolved element; with `file_input`, the file
    /// input it stands for (itself, its label control, or a descendant).
    pub async fn element(
        &self,
        resolution: &Resolution,
        file_input: bool,
    ) -> ActResult<Option<RemoteObjectId>> {
        let mut args = resolution.op_args();
        args["fileInput"] = json!(file_input);
        self.session
            .evaluate_handle(&resolution.frame_id, &ops::ELEMENT.expression(&args))
            .await
            .map_err(|err| internal_in_frame("element", &resolution.frame_id, err))
    }

    /// Candidate previews across populated frames, in global order.
    /// Returns the previews (at most `limit`) and the count of hidden matches.
    pub async fn candidates(
        &self,
        query: &Query,
        index: &FrameIndex,
        limit: usize,
        hidden_only: bool,
    ) -> ActResult<(Vec<CandidateHint>, usize)> {
        let mut out = Vec::new();
        let mut hidden_total = 0;
        for (summary, offset) in index.populated() {
            let args = json!({
                "query": ops::query_arg(query),
                "limit": limit,
                "hiddenOnly": hidden_only,
            });
            let value = self.run(&summary.frame_id, ops::CANDIDATES, &args).await?;
            let result: CandidatesResult = serde_json::from_value(value).map_err(|err| {
                ActError::internal("candidates", format!("malformed candidates: {err}"))
            })?;
            hidden_total += result.hidden;
            for item in result.items {
                if out.len() >= limit {
                    break;
                }
                out.push(CandidateHint {
                    index: offset + item.index,
                    frame_id: summary.frame_id.to_string(),
                    visible: item.preview.visible,
                    text: item.preview.text,
                    selector_hint: item.preview.selector_hint,
                });
            }
        }
        Ok((out, hidden_total))
    }

    async fn selection_failure(&self, query: &Query, index: &FrameIndex, reason: QueryFailure) -> ActError {
        let described = query.describe();
        let count = index.match_count();
        let mut err = match reason {
            QueryFailure::NoMatch => ActError::query(reason, format!("no element matches {described}")),
            QueryFailure::NoVisibleMatch if count == 0 => {
                ActError::query(reason, format!("no element matches {described}"))
            }
            QueryFailure::NoVisibleMatch => ActError::query(
                reason,
                format!("{count} element(s) match {described} but none is visible"),
            )
            .with_hint("drop --visible-only to act on a hidden match"),
            QueryFailure::IndexOutOfRange => {
                let requested = query.index.unwrap_or_default();
                ActError::query(
                    reason,
                    format!("--index {requested} is out of range for {count} match(es) of {described}"),
                )
                .with_hint(format!("use an index between 0 and {}", count.saturating_sub(1)))
            }
            QueryFailure::NotVisibleAtIndex => {
                let requested = query.index.unwrap_or_default();
                let err = ActError::query(
                    reason,
                    format!("match {requested} of {described} is not visible"),
                );
                match index.first_visible() {
                    Some(first) => err.with_hint(format!("index {first} is the first visible match")),
                    None => err.with_hint("drop --visible-only to act on a hidden match"),
                }
            }
            other => ActError::query(other, format!("cannot select a match for {described}")),
        };

        let frames_total = self.session.frames().len();
        if query.frame_scope == FrameScope::Main && frames_total > 1 {
            err = err.with_hint(format!(
                "the page has {} child frame(s); retry with --frame-scope all",
                frames_total - 1
            ));
        }
        if count == 0 && query.mode == crate::types::QueryMode::Text {
            err = err.with_hint("text matches are exact; use --contains for a substring match");
        }
        err = err.with_hint("run explain with the same query to list candidates");

        let candidates = if count > 0 {
            match self.candidates(query, index, FAILURE_CANDIDATES, false).await {
                Ok((candidates, _)) => candidates,
                Err(lookup) => {
                    debug!(error = %lookup, "candidate lookup failed while reporting selection failure");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        err.with_query_context(|ctx| {
            ctx.match_count = Some(count);
            ctx.visible_count = Some(index.visible_count());
            ctx.requested_index = query.index;
            ctx.frame_scope = Some(query.frame_scope.as_str().to_string());
            ctx.frames_scanned = Some(index.frames_scanned());
            ctx.frames_skipped = index
                .skipped_frames()
                .iter()
                .map(ToString::to_string)
                .collect();
            ctx.candidates = candidates;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MatchPage;
    use crate::types::QueryInput;

    fn frames(counts: &[(usize, Option<usize>)]) -> FrameIndex {
        FrameIndex::new(
            counts
                .iter()
                .enumerate()
                .map(|(pos, (raw, first))| FrameSummary::new(format!("F{pos}").into(), *raw, *first))
                .collect(),
        )
    }

    #[test]
    fn empty_set_fails_before_index_checks() {
        let index = frames(&[(0, None)]);
        assert_eq!(select(&index, Some(0), false), Err(QueryFailure::NoMatch));
        assert_eq!(select(&index, None, true), Err(QueryFailure::NoVisibleMatch));
    }

    #[test]
    fn explicit_index_must_be_in_range() {
        let index = frames(&[(2, Some(0)), (1, None)]);
        assert_eq!(select(&index, Some(3), false), Err(QueryFailure::IndexOutOfRange));
        assert_eq!(select(&index, Some(99), true), Err(QueryFailure::IndexOutOfRange));
        assert_eq!(select(&index, Some(2), false), Ok(Pick::Index(2)));
        assert_eq!(select(&index, Some(2), true), Ok(Pick::CheckVisible(2)));
    }

    #[test]
    fn default_pick_is_zero_without_visibility() {
        let index = frames(&[(0, None), (4, None)]);
        assert_eq!(select(&index, None, false), Ok(Pick::Index(0)));
        assert_eq!(select(&index, None, true), Err(QueryFailure::NoVisibleMatch));
    }

    #[test]
    fn visible_pick_adds_frame_offset() {
        let index = frames(&[(2, None), (3, Some(2))]);
        assert_eq!(select(&index, None, true), Ok(Pick::Index(4)));
    }

    fn query(input: QueryInput) -> Query {
        Query::parse(&input).unwrap().unwrap()
    }

    #[tokio::test]
    async fn resolves_explicit_visible_index() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true, true, true]);
        let session = page.open().await;
        let resolver = QueryResolver::new(&session);

        let resolution = resolver
            .resolve(&query(QueryInput::text("Delete").with_index(1).visible_only()))
            .await
            .unwrap();
        assert_eq!(resolution.match_count(), 3);
        assert_eq!(resolution.picked, 1);
        assert_eq!(resolution.local_index, 1);
    }

    #[tokio::test]
    async fn out_of_range_index_is_query_invalid() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true, true, true]);
        let session = page.open().await;
        let err = QueryResolver::new(&session)
            .resolve(&query(QueryInput::text("Delete").with_index(99).visible_only()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_QUERY_INVALID");
        assert_eq!(err.query_reason(), Some(QueryFailure::IndexOutOfRange));
        match err {
            ActError::QueryInvalid { context, .. } => {
                assert_eq!(context.match_count, Some(3));
                assert_eq!(context.requested_index, Some(99));
                assert_eq!(context.candidates.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn hidden_match_at_index_is_rejected() {
        let page = MatchPage::new(&["MAIN"]).with_matches("MAIN", &[true, false]);
        let session = page.open().await;
        let err = QueryResolver::new(&session)
            .resolve(&query(QueryInput::selector("button").with_index(1).visible_only()))
            .await
            .unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::NotVisibleAtIndex));
        assert!(err.hints().as_slice()[0].contains("index 0"));
    }

    #[tokio::test]
    async fn all_scope_concatenates_frames_and_skips_dead_ones() {
        let page = MatchPage::new(&["MAIN", "DEAD", "CHILD"])
            .with_matches("MAIN", &[false, false])
            .with_matches("CHILD", &[false, true])
            .with_failing_frame("DEAD");
        let session = page.open().await;
        let resolution = QueryResolver::new(&session)
            .resolve(&query(
                QueryInput::contains("save").visible_only().with_scope(FrameScope::All),
            ))
            .await
            .unwrap();
        assert_eq!(resolution.match_count(), 4);
        assert_eq!(resolution.picked, 3);
        assert_eq!(resolution.frame_id, FrameCdpId::from("CHILD"));
        assert_eq!(resolution.local_index, 1);
        assert_eq!(resolution.index.skipped_frames(), vec![FrameCdpId::from("DEAD")]);
    }

    #[tokio::test]
    async fn main_scope_ignores_child_frames_and_hints_at_them() {
        let page = MatchPage::new(&["MAIN", "CHILD"]).with_matches("CHILD", &[true]);
        let session = page.open().await;
        let err = QueryResolver::new(&session)
            .resolve(&query(QueryInput::text("Pay").visible_only()))
            .await
            .unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::NoVisibleMatch));
        assert!(err
            .hints()
            .as_slice()
            .iter()
            .any(|hint| hint.contains("--frame-scope all")));
    }

    #[tokio::test]
    async fn main_frame_failure_is_internal() {
        let page = MatchPage::new(&["MAIN"]).with_failing_frame("MAIN");
        let session = page.open().await;
        let err = QueryResolver::new(&session)
            .resolve(&query(QueryInput::text("x")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_INTERNAL");
    }

    #[tokio::test]
    async fn invalid_selector_is_query_invalid() {
        let page = MatchPage::new(&["MAIN"]).with_invalid_selector();
        let session = page.open().await;
        let err = QueryResolver::new(&session)
            .resolve(&query(QueryInput::selector("button[")))
            .await
            .unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::InvalidSelector));
    }
}
