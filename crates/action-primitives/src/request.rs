//! Caller requests and their pre-browser validation.
//!
//! Everything that can be rejected without a page is rejected here, so a
//! malformed invocation never opens a CDP session.

use std::path::{Path, PathBuf};
use std::time::Duration;

use action_gate::{AssertionSpec, EvidenceOptions};
use action_locator::{Query, QueryInput};
use cdp_adapter::KeyChord;
use regex::Regex;
use soulact_core_types::{ActError, ActResult, ActionKind, QueryFailure};

use crate::report::UploadedFile;
use crate::waiting::{WaitMode, WaitSpec};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadArgs {
    pub files: Vec<PathBuf>,
    pub submit_selector: Option<String>,
    pub verify_selector: Option<String>,
    pub verify_text: Option<String>,
    pub verify_filename_regex: Option<String>,
    pub verify_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadArgs {
    pub out_dir: Option<PathBuf>,
    pub fallback: bool,
}

impl Default for DownloadArgs {
    fn default() -> Self {
        Self {
            out_dir: None,
            fallback: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialogArgs {
    pub accept: bool,
    pub dismiss: bool,
    pub prompt_text: Option<String>,
}

/// Verb and its verb-only options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerbArgs {
    Click,
    Fill { value: String },
    Keypress { key: String },
    Upload(UploadArgs),
    Download(DownloadArgs),
    Dialog(DialogArgs),
    DragDrop { source: String, target: String },
    Spawn,
    Explain,
}

impl VerbArgs {
    pub fn kind(&self) -> ActionKind {
        match self {
            VerbArgs::Click => ActionKind::Click,
            VerbArgs::Fill { .. } => ActionKind::Fill,
            VerbArgs::Keypress { .. } => ActionKind::Keypress,
            VerbArgs::Upload(_) => ActionKind::Upload,
            VerbArgs::Download(_) => ActionKind::Download,
            VerbArgs::Dialog(_) => ActionKind::Dialog,
            VerbArgs::DragDrop { .. } => ActionKind::DragDrop,
            VerbArgs::Spawn => ActionKind::Spawn,
            VerbArgs::Explain => ActionKind::Explain,
        }
    }
}

/// One invocation as the caller described it.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub verb: VerbArgs,
    pub query: QueryInput,
    pub wait: WaitSpec,
    pub timeout: Duration,
    pub evidence: EvidenceOptions,
    pub assertions: AssertionSpec,
    /// Session id or CDP origin.
    pub session: Option<String>,
    pub target: Option<String>,
}

impl ActionRequest {
    pub fn new(verb: VerbArgs, query: QueryInput) -> Self {
        Self {
            verb,
            query,
            wait: WaitSpec::default(),
            timeout: Duration::from_millis(5_000),
            evidence: EvidenceOptions::default(),
            assertions: AssertionSpec::default(),
            session: None,
            target: None,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.verb.kind()
    }

    /// Checks every option combination and produces the executable plan.
    pub fn validate(&self) -> ActResult<ActionPlan> {
        let kind = self.kind();
        let query = Query::parse(&self.query)?;
        check_query_requirement(kind, query.as_ref())?;

        let wait = self.wait.validate()?;
        self.assertions.validate()?;
        if kind == ActionKind::Explain {
            reject_explain_evidence(self)?;
        }
        if self.timeout.is_zero() {
            return Err(ActError::query(QueryFailure::InvalidOptions, "--timeout must be positive"));
        }

        let verb = match &self.verb {
            VerbArgs::Click => PlannedVerb::Click,
            VerbArgs::Fill { value } => PlannedVerb::Fill {
                value: value.clone(),
            },
            VerbArgs::Keypress { key } => {
                let chord = KeyChord::parse(key).map_err(|err| {
                    ActError::query(
                        QueryFailure::InvalidOptions,
                        format!("--key {key:?} is not a recognised key: {err}"),
                    )
                    .with_hint("use a key name such as Enter, Tab, a or a chord such as Ctrl+A")
                })?;
                PlannedVerb::Keypress(chord)
            }
            VerbArgs::Upload(args) => PlannedVerb::Upload(plan_upload(args, self.timeout)?),
            VerbArgs::Download(args) => PlannedVerb::Download(args.clone()),
            VerbArgs::Dialog(args) => PlannedVerb::Dialog(plan_dialog(args)?),
            VerbArgs::DragDrop { source, target } => {
                for (flag, value) in [("--source", source), ("--target", target)] {
                    if value.trim().is_empty() {
                        return Err(ActError::query(
                            QueryFailure::InvalidOptions,
                            format!("{flag} must be a non-empty CSS selector"),
                        ));
                    }
                }
                PlannedVerb::DragDrop {
                    source: source.clone(),
                    target: target.clone(),
                }
            }
            VerbArgs::Spawn => PlannedVerb::Spawn,
            VerbArgs::Explain => PlannedVerb::Explain,
        };

        Ok(ActionPlan {
            kind,
            query,
            wait,
            timeout: self.timeout,
            verb,
        })
    }
}

fn check_query_requirement(kind: ActionKind, query: Option<&Query>) -> ActResult<()> {
    let handle = query.is_some_and(Query::is_handle);
    match kind {
        ActionKind::Click => {}
        ActionKind::Explain if handle => {
            return Err(ActError::query(
                QueryFailure::MutuallyExclusive,
                "explain cannot be combined with --handle",
            )
            .with_hint("explain previews query disambiguation; use --text, --selector or --contains")
            .with_query_context(|ctx| ctx.conflicting = vec!["--handle".to_string()]));
        }
        _ if handle => {
            return Err(ActError::query(
                QueryFailure::InvalidOptions,
                format!("--handle is only supported by click, not {kind}"),
            )
            .with_hint("address the element with --text, --selector or --contains"));
        }
        ActionKind::DragDrop if query.is_some() => {
            return Err(ActError::query(
                QueryFailure::InvalidOptions,
                "drag-drop takes --source and --target, not a query",
            )
            .with_hint("drop --text/--selector/--contains"));
        }
        _ => {}
    }

    let optional = matches!(kind, ActionKind::Keypress | ActionKind::Dialog | ActionKind::DragDrop);
    if query.is_none() && !optional {
        return Err(ActError::query(
            QueryFailure::InvalidOptions,
            format!("{kind} needs a query"),
        )
        .with_hint(if kind == ActionKind::Click {
            "add one of --text, --selector, --contains or --handle"
        } else {
            "add one of --text, --selector or --contains"
        }));
    }
    Ok(())
}

fn reject_explain_evidence(request: &ActionRequest) -> ActResult<()> {
    let mut conflicting = Vec::new();
    if !request.wait.is_empty() {
        if request.wait.text.is_some() {
            conflicting.push("--wait-for-text");
        }
        if request.wait.selector.is_some() {
            conflicting.push("--wait-for-selector");
        }
        if request.wait.network_idle {
            conflicting.push("--wait-network-idle");
        }
    }
    if request.evidence.snapshot {
        conflicting.push("--snapshot");
    }
    if request.evidence.delta {
        conflicting.push("--delta");
    }
    if request.evidence.proof {
        conflicting.push("--proof");
    }
    if !request.assertions.is_empty() {
        conflicting.push("--assert-*");
    }
    if conflicting.is_empty() {
        return Ok(());
    }
    let conflicting: Vec<String> = conflicting.into_iter().map(str::to_string).collect();
    Err(ActError::query(
        QueryFailure::MutuallyExclusive,
        format!("explain is a dry run and cannot take {}", conflicting.join(", ")),
    )
    .with_hint("run the real verb to collect post-action evidence")
    .with_query_context(|ctx| ctx.conflicting = conflicting))
}

/// Upload result check.
#[derive(Debug, Clone)]
pub enum UploadVerify {
    Selector(String),
    Text(String),
    FilenameRegex(Regex),
}

impl UploadVerify {
    pub fn mode(&self) -> &'static str {
        match self {
            UploadVerify::Selector(_) => "selector",
            UploadVerify::Text(_) => "text",
            UploadVerify::FilenameRegex(_) => "filename-regex",
        }
    }

    pub fn value(&self) -> String {
        match self {
            UploadVerify::Selector(value) | UploadVerify::Text(value) => value.clone(),
            UploadVerify::FilenameRegex(regex) => regex.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub files: Vec<UploadedFile>,
    pub submit_selector: Option<String>,
    pub verify: Option<UploadVerify>,
    pub verify_timeout: Duration,
}

fn plan_upload(args: &UploadArgs, timeout: Duration) -> ActResult<UploadPlan> {
    if args.files.is_empty() {
        return Err(ActError::query(QueryFailure::InvalidOptions, "upload needs at least one --file"));
    }
    let files = args
        .files
        .iter()
        .map(|path| inspect_file(path))
        .collect::<ActResult<Vec<_>>>()?;

    let mut set = Vec::new();
    if args.verify_selector.is_some() {
        set.push("--verify-selector".to_string());
    }
    if args.verify_text.is_some() {
        set.push("--verify-text".to_string());
    }
    if args.verify_filename_regex.is_some() {
        set.push("--verify-filename-regex".to_string());
    }
    if set.len() > 1 {
        return Err(ActError::query(
            QueryFailure::MutuallyExclusive,
            format!("only one upload verification is allowed, got {}", set.join(", ")),
        )
        .with_query_context(|ctx| ctx.conflicting = set));
    }

    let verify = if let Some(selector) = &args.verify_selector {
        Some(UploadVerify::Selector(selector.clone()))
    } else if let Some(text) = &args.verify_text {
        Some(UploadVerify::Text(text.clone()))
    } else if let Some(pattern) = &args.verify_filename_regex {
        let regex = Regex::new(pattern).map_err(|err| {
            ActError::query(
                QueryFailure::InvalidOptions,
                format!("--verify-filename-regex is not a valid pattern: {err}"),
            )
        })?;
        Some(UploadVerify::FilenameRegex(regex))
    } else {
        None
    };
    if args.verify_timeout.is_some() && verify.is_none() {
        return Err(ActError::query(
            QueryFailure::InvalidOptions,
            "--verify-timeout needs a --verify-* option",
        ));
    }
    if args
        .submit_selector
        .as_deref()
        .is_some_and(|selector| selector.trim().is_empty())
    {
        return Err(ActError::query(
            QueryFailure::InvalidOptions,
            "--submit-selector must not be empty",
        ));
    }

    Ok(UploadPlan {
        files,
        submit_selector: args.submit_selector.clone(),
        verify,
        verify_timeout: args.verify_timeout.unwrap_or(timeout),
    })
}

fn inspect_file(path: &Path) -> ActResult<UploadedFile> {
    let not_found = |detail: String| {
        ActError::query(QueryFailure::FileNotFound, detail)
            .with_hint("paths are resolved against the current directory")
    };
    let metadata = std::fs::metadata(path)
        .map_err(|err| not_found(format!("cannot read {}: {err}", path.display())))?;
    if !metadata.is_file() {
        return Err(not_found(format!("{} is not a regular file", path.display())));
    }
    let absolute = std::fs::canonicalize(path)
        .map_err(|err| not_found(format!("cannot resolve {}: {err}", path.display())))?;
    let name = absolute
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(UploadedFile {
        path: absolute.to_string_lossy().into_owned(),
        name,
        bytes: metadata.len(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogPlan {
    pub accept: bool,
    pub prompt_text: Option<String>,
}

fn plan_dialog(args: &DialogArgs) -> ActResult<DialogPlan> {
    if args.accept && args.dismiss {
        return Err(ActError::query(
            QueryFailure::MutuallyExclusive,
            "--accept and --dismiss are mutually exclusive",
        )
        .with_query_context(|ctx| {
            ctx.conflicting = vec!["--accept".to_string(), "--dismiss".to_string()]
        }));
    }
    if args.dismiss && args.prompt_text.is_some() {
        return Err(ActError::query(
            QueryFailure::MutuallyExclusive,
            "--prompt-text only applies when accepting",
        )
        .with_query_context(|ctx| {
            ctx.conflicting = vec!["--dismiss".to_string(), "--prompt-text".to_string()]
        }));
    }
    Ok(DialogPlan {
        accept: !args.dismiss,
        prompt_text: args.prompt_text.clone(),
    })
}

/// Validated verb options.
#[derive(Debug, Clone)]
pub enum PlannedVerb {
    Click,
    Fill { value: String },
    Keypress(KeyChord),
    Upload(UploadPlan),
    Download(DownloadArgs),
    Dialog(DialogPlan),
    DragDrop { source: String, target: String },
    Spawn,
    Explain,
}

/// A request that passed validation.
#[derive(Debug, Clone)]
pub struct ActionPlan {
    pub kind: ActionKind,
    pub query: Option<Query>,
    pub wait: Option<WaitMode>,
    pub timeout: Duration,
    pub verb: PlannedVerb,
}
