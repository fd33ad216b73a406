//! Error taxonomy shared by every engine layer.
//!
//! Each kind carries its own typed context, emitted verbatim as
//! `hintContext` in the failure envelope.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Upper bound on hints attached to one error.
pub const MAX_HINTS: usize = 3;

/// Ranked, actionable hints. Anything past [`MAX_HINTS`] is dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Hints(Vec<String>);

impl Hints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hint: impl Into<String>) {
        if self.0.len() < MAX_HINTS {
            self.0.push(hint.into());
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Hints {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut hints = Hints::new();
        for hint in iter.into_iter().take(MAX_HINTS) {
            hints.push(hint);
        }
        hints
    }
}

/// Why a query or option set was rejected.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFailure {
    #[default]
    InvalidOptions,
    MutuallyExclusive,
    InvalidSelector,
    InvalidHandle,
    NoMatch,
    NoVisibleMatch,
    IndexOutOfRange,
    NotVisibleAtIndex,
    NotFillable,
    TargetNotFound,
    FileNotFound,
    UnknownSession,
}

impl QueryFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryFailure::InvalidOptions => "invalid_options",
            QueryFailure::MutuallyExclusive => "mutually_exclusive",
            QueryFailure::InvalidSelector => "invalid_selector",
            QueryFailure::InvalidHandle => "invalid_handle",
            QueryFailure::NoMatch => "no_match",
            QueryFailure::NoVisibleMatch => "no_visible_match",
            QueryFailure::IndexOutOfRange => "index_out_of_range",
            QueryFailure::NotVisibleAtIndex => "not_visible_at_index",
            QueryFailure::NotFillable => "not_fillable",
            QueryFailure::TargetNotFound => "target_not_found",
            QueryFailure::FileNotFound => "file_not_found",
            QueryFailure::UnknownSession => "unknown_session",
        }
    }
}

/// Compact candidate preview carried in query failures.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateHint {
    pub index: usize,
    pub frame_id: String,
    pub visible: bool,
    pub text: String,
    pub selector_hint: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryContext {
    pub reason: QueryFailure,
    pub match_count: Option<usize>,
    pub visible_count: Option<usize>,
    pub requested_index: Option<usize>,
    pub frame_scope: Option<String>,
    pub frames_scanned: Option<usize>,
    pub frames_skipped: Vec<String>,
    pub conflicting: Vec<String>,
    pub candidates: Vec<CandidateHint>,
}

/// Which budgeted wait ran out.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPhase {
    #[default]
    PostAction,
    UploadVerify,
    DownloadEvent,
    DialogEvent,
    SpawnEvent,
    FileChooser,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitContext {
    pub phase: WaitPhase,
    pub mode: Option<String>,
    pub value: Option<String>,
    pub timeout_ms: u64,
    pub elapsed_ms: u64,
    pub frame_scope: Option<String>,
    pub frames_checked: usize,
}

/// One evaluated caller assertion.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionOutcome {
    pub name: String,
    pub expected: Value,
    pub actual: Value,
    pub passed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertContext {
    pub total: usize,
    pub failed: Vec<AssertionOutcome>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalContext {
    pub operation: String,
    pub cdp_method: Option<String>,
    pub frame_id: Option<String>,
    pub detail: Option<String>,
}

/// Typed failure surfaced by every verb.
#[derive(Clone, Debug, Error)]
pub enum ActError {
    /// Caller input or disambiguation failure
    #[error("{message}")]
    QueryInvalid {
        message: String,
        hints: Hints,
        context: QueryContext,
    },

    /// Budgeted wait exceeded
    #[error("{message}")]
    WaitTimeout {
        message: String,
        hints: Hints,
        context: WaitContext,
    },

    /// Explicit caller assertion not met
    #[error("{message}")]
    AssertFailed {
        message: String,
        hints: Hints,
        context: AssertContext,
    },

    /// Engine invariant violated or protocol failure
    #[error("{message}")]
    Internal {
        message: String,
        hints: Hints,
        context: InternalContext,
    },
}

pub type ActResult<T> = Result<T, ActError>;

impl ActError {
    pub fn query(reason: QueryFailure, message: impl Into<String>) -> Self {
        ActError::QueryInvalid {
            message: message.into(),
            hints: Hints::new(),
            context: QueryContext {
                reason,
                ..QueryContext::default()
            },
        }
    }

    pub fn wait_timeout(context: WaitContext, message: impl Into<String>) -> Self {
        ActError::WaitTimeout {
            message: message.into(),
            hints: Hints::new(),
            context,
        }
    }

    pub fn assert_failed(total: usize, failed: Vec<AssertionOutcome>) -> Self {
        let names: Vec<&str> = failed.iter().map(|a| a.name.as_str()).collect();
        let message = format!(
            "{} of {} assertion(s) failed: {}",
            failed.len(),
            total,
            names.join(", ")
        );
        ActError::AssertFailed {
            message,
            hints: Hints::new(),
            context: AssertContext { total, failed },
        }
    }

    pub fn internal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ActError::Internal {
            message: message.into(),
            hints: Hints::new(),
            context: InternalContext {
                operation: operation.into(),
                ..InternalContext::default()
            },
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints_mut().push(hint);
        self
    }

    /// Applies `f` to the query context; no-op for other kinds.
    pub fn with_query_context(mut self, f: impl FnOnce(&mut QueryContext)) -> Self {
        if let ActError::QueryInvalid { context, .. } = &mut self {
            f(context);
        }
        self
    }

    /// Applies `f` to the internal context; no-op for other kinds.
    pub fn with_internal_context(mut self, f: impl FnOnce(&mut InternalContext)) -> Self {
        if let ActError::Internal { context, .. } = &mut self {
            f(context);
        }
        self
    }

    pub fn code(&self) -> &'static str {
        match self {
            ActError::QueryInvalid { .. } => "E_QUERY_INVALID",
            ActError::WaitTimeout { .. } => "E_WAIT_TIMEOUT",
            ActError::AssertFailed { .. } => "E_ASSERT_FAILED",
            ActError::Internal { .. } => "E_INTERNAL",
        }
    }

    /// Process exit status for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            ActError::Internal { .. } => 1,
            ActError::QueryInvalid { .. } => 2,
            ActError::WaitTimeout { .. } => 3,
            ActError::AssertFailed { .. } => 4,
        }
    }

    /// Whether the caller may reasonably retry the same invocation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActError::WaitTimeout { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            ActError::QueryInvalid { message, .. }
            | ActError::WaitTimeout { message, .. }
            | ActError::AssertFailed { message, .. }
            | ActError::Internal { message, .. } => message,
        }
    }

    pub fn hints(&self) -> &Hints {
        match self {
            ActError::QueryInvalid { hints, .. }
            | ActError::WaitTimeout { hints, .. }
            | ActError::AssertFailed { hints, .. }
            | ActError::Internal { hints, .. } => hints,
        }
    }

    fn hints_mut(&mut self) -> &mut Hints {
        match self {
            ActError::QueryInvalid { hints, .. }
            | ActError::WaitTimeout { hints, .. }
            | ActError::AssertFailed { hints, .. }
            | ActError::Internal { hints, .. } => hints,
        }
    }

    pub fn query_reason(&self) -> Option<QueryFailure> {
        match self {
            ActError::QueryInvalid { context, .. } => Some(context.reason),
            _ => None,
        }
    }

    pub fn envelope(&self) -> FailureEnvelope<'_> {
        let hint_context = match self {
            ActError::QueryInvalid { context, .. } => HintContextRef::Query(context),
            ActError::WaitTimeout { context, .. } => HintContextRef::Wait(context),
            ActError::AssertFailed { context, .. } => HintContextRef::Assert(context),
            ActError::Internal { context, .. } => HintContextRef::Internal(context),
        };
        FailureEnvelope {
            ok: false,
            code: self.code(),
            message: self.message(),
            hints: self.hints(),
            hint_context,
        }
    }
}

/// `{ok:false, code, message, hints, hintContext}` as written to stdout.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEnvelope<'a> {
    pub ok: bool,
    pub code: &'static str,
    pub message: &'a str,
    pub hints: &'a Hints,
    pub hint_context: HintContextRef<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum HintContextRef<'a> {
    Query(&'a QueryContext),
    Wait(&'a WaitContext),
    Assert(&'a AssertContext),
    Internal(&'a InternalContext),
}
