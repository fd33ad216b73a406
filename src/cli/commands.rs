use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Click the matched element
    Click(ClickArgs),

    /// Replace the value of a fillable element
    Fill(FillArgs),

    /// Press a key or chord on the matched element, or the focused one
    Keypress(KeypressArgs),

    /// Attach local files to a file input
    Upload(UploadCmdArgs),

    /// Click a link or button and save the file it downloads
    Download(DownloadCmdArgs),

    /// Answer the next JavaScript dialog
    Dialog(DialogCmdArgs),

    /// Drag one element onto another
    DragDrop(DragDropArgs),

    /// Click and report the tab it opens
    Spawn(SpawnArgs),

    /// Preview how a query resolves without acting
    Explain(ExplainArgs),
}

impl Commands {
    /// Session id and target id hints.
    pub fn session(&self) -> (Option<String>, Option<String>) {
        match self {
            Commands::DragDrop(args) => (args.session.session.clone(), args.session.target_id.clone()),
            Commands::Click(ClickArgs { session, .. })
            | Commands::Fill(FillArgs { session, .. })
            | Commands::Keypress(KeypressArgs { session, .. })
            | Commands::Upload(UploadCmdArgs { session, .. })
            | Commands::Download(DownloadCmdArgs { session, .. })
            | Commands::Dialog(DialogCmdArgs { session, .. })
            | Commands::Spawn(SpawnArgs { session, .. })
            | Commands::Explain(ExplainArgs { session, .. }) => {
                (session.session.clone(), session.target.clone())
            }
        }
    }

    pub fn common(&self) -> &CommonArgs {
        match self {
            Commands::Click(args) => &args.common,
            Commands::Fill(args) => &args.common,
            Commands::Keypress(args) => &args.common,
            Commands::Upload(args) => &args.common,
            Commands::Download(args) => &args.common,
            Commands::Dialog(args) => &args.common,
            Commands::DragDrop(args) => &args.common,
            Commands::Spawn(args) => &args.common,
            Commands::Explain(args) => &args.common,
        }
    }
}

/// Element addressing.
#[derive(Args, Debug, Clone, Default)]
pub struct QueryArgs {
    /// Exact accessible text (case-insensitive, whitespace-collapsed)
    #[arg(long)]
    pub text: Option<String>,

    /// CSS selector
    #[arg(long)]
    pub selector: Option<String>,

    /// Accessible text substring
    #[arg(long)]
    pub contains: Option<String>,

    /// Backend node id (`123` or `node:123`), click only
    #[arg(long)]
    pub handle: Option<String>,

    /// Pick the n-th match (0-based)
    #[arg(long)]
    pub index: Option<usize>,

    /// Only consider visible matches
    #[arg(long)]
    pub visible_only: bool,

    /// Frames to search: main or all
    #[arg(long, value_name = "SCOPE")]
    pub frame_scope: Option<String>,
}

/// Post-action wait.
#[derive(Args, Debug, Clone, Default)]
pub struct WaitArgs {
    /// Wait until this text is visible
    #[arg(long)]
    pub wait_for_text: Option<String>,

    /// Wait until this selector matches a visible element
    #[arg(long)]
    pub wait_for_selector: Option<String>,

    /// Wait until the network has been quiet for a while
    #[arg(long)]
    pub wait_network_idle: bool,

    /// Budget for the whole action (`5s`, `750ms`, or bare milliseconds)
    #[arg(long, value_name = "DURATION")]
    pub timeout: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct EvidenceArgs {
    /// Include page state after the action
    #[arg(long)]
    pub snapshot: bool,

    /// Include what changed between before and after
    #[arg(long)]
    pub delta: bool,

    /// ARIA attribute to track on the element (repeatable)
    #[arg(long = "aria-attr", value_name = "NAME")]
    pub aria_attrs: Vec<String>,

    /// Include a compact proof envelope
    #[arg(long)]
    pub proof: bool,

    #[arg(long, value_name = "TEXT")]
    pub assert_url_contains: Option<String>,

    #[arg(long, value_name = "TEXT")]
    pub assert_title_contains: Option<String>,

    #[arg(long, value_name = "TEXT")]
    pub assert_text: Option<String>,

    #[arg(long, value_name = "SELECTOR")]
    pub assert_selector: Option<String>,

    /// Expected match count for --assert-selector
    #[arg(long, value_name = "N")]
    pub assert_count: Option<usize>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SessionArgs {
    /// Session id, or a CDP origin to act on directly
    #[arg(long)]
    pub session: Option<String>,

    /// Target (tab) id
    #[arg(long)]
    pub target: Option<String>,
}

/// `--target` names the drop target on drag-drop, so the tab goes by
/// `--target-id` there.
#[derive(Args, Debug, Clone, Default)]
pub struct DragSessionArgs {
    /// Session id, or a CDP origin to act on directly
    #[arg(long)]
    pub session: Option<String>,

    /// Target (tab) id
    #[arg(long)]
    pub target_id: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    #[command(flatten)]
    pub query: QueryArgs,

    #[command(flatten)]
    pub wait: WaitArgs,

    #[command(flatten)]
    pub evidence: EvidenceArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ClickArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct FillArgs {
    /// New value
    #[arg(long)]
    pub value: String,

    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct KeypressArgs {
    /// Key name or chord, e.g. `Enter`, `Ctrl+A`
    #[arg(long)]
    pub key: String,

    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct UploadCmdArgs {
    /// File to attach (repeatable)
    #[arg(long = "file", value_name = "PATH")]
    pub files: Vec<PathBuf>,

    /// Click this selector after attaching
    #[arg(long, value_name = "SELECTOR")]
    pub submit_selector: Option<String>,

    #[arg(long, value_name = "SELECTOR")]
    pub verify_selector: Option<String>,

    #[arg(long, value_name = "TEXT")]
    pub verify_text: Option<String>,

    #[arg(long, value_name = "REGEX")]
    pub verify_filename_regex: Option<String>,

    #[arg(long, value_name = "DURATION")]
    pub verify_timeout: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct DownloadCmdArgs {
    /// Directory for the saved file
    #[arg(long, value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// Fail instead of fetching the file in-page when no download starts
    #[arg(long)]
    pub no_fallback: bool,

    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct DialogCmdArgs {
    #[arg(long)]
    pub accept: bool,

    #[arg(long)]
    pub dismiss: bool,

    /// Text for a prompt dialog
    #[arg(long)]
    pub prompt_text: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct DragDropArgs {
    /// CSS selector of the element to drag
    #[arg(long)]
    pub source: String,

    /// CSS selector of the drop target
    #[arg(long)]
    pub target: String,

    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub session: DragSessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct SpawnArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ExplainArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub session: SessionArgs,
}
