//! Query model

use serde::{Deserialize, Serialize};
use soulact_core_types::{ActError, ActResult, QueryFailure};

/// How a query string is matched against the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Exact, case-insensitive match on accessible text
    Text,
    /// CSS selector via `querySelectorAll`
    Selector,
    /// Substring match on accessible text
    Contains,
    /// CDP backend node id
    Handle,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Text => "text",
            QueryMode::Selector => "selector",
            QueryMode::Contains => "contains",
            QueryMode::Handle => "handle",
        }
    }
}

/// Which frames a query searches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameScope {
    #[default]
    Main,
    All,
}

impl FrameScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameScope::Main => "main",
            FrameScope::All => "all",
        }
    }

    pub fn parse(raw: &str) -> ActResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" => Ok(FrameScope::Main),
            "all" => Ok(FrameScope::All),
            other => Err(ActError::query(
                QueryFailure::InvalidOptions,
                format!("unknown frame scope '{other}'"),
            )
            .with_hint("use --frame-scope main or --frame-scope all")),
        }
    }
}

/// Raw query options as supplied by the caller, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryInput {
    pub text: Option<String>,
    pub selector: Option<String>,
    pub contains: Option<String>,
    pub handle: Option<String>,
    pub index: Option<usize>,
    pub visible_only: bool,
    pub frame_scope: Option<FrameScope>,
}

impl QueryInput {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            text: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn selector(value: impl Into<String>) -> Self {
        Self {
            selector: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn contains(value: impl Into<String>) -> Self {
        Self {
            contains: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn handle(value: impl Into<String>) -> Self {
        Self {
            handle: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn visible_only(mut self) -> Self {
        self.visible_only = true;
        self
    }

    pub fn with_scope(mut self, scope: FrameScope) -> Self {
        self.frame_scope = Some(scope);
        self
    }

    /// Names of the query-string options that were supplied.
    fn supplied(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.text.is_some() {
            names.push("text");
        }
        if self.selector.is_some() {
            names.push("selector");
        }
        if self.contains.is_some() {
            names.push("contains");
        }
        if self.handle.is_some() {
            names.push("handle");
        }
        names
    }

    pub fn is_empty(&self) -> bool {
        self.supplied().is_empty()
    }
}

/// Validated, immutable query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub mode: QueryMode,
    pub raw_query: String,
    pub backend_node_id: Option<i64>,
    pub index: Option<usize>,
    pub visible_only: bool,
    pub frame_scope: FrameScope,
}

impl Query {
    /// Validates caller options. `Ok(None)` when no query option was given.
    pub fn parse(input: &QueryInput) -> ActResult<Option<Query>> {
        let supplied = input.supplied();
        if supplied.len() > 1 {
            let flags: Vec<String> = supplied.iter().map(|name| format!("--{name}")).collect();
            return Err(ActError::query(
                QueryFailure::MutuallyExclusive,
                format!("{} are mutually exclusive", flags.join(", ")),
            )
            .with_hint("supply exactly one of --text, --selector, --contains, --handle")
            .with_query_context(|ctx| ctx.conflicting = flags));
        }

        let (mode, raw) = if let Some(text) = &input.text {
            (QueryMode::Text, text)
        } else if let Some(selector) = &input.selector {
            (QueryMode::Selector, selector)
        } else if let Some(contains) = &input.contains {
            (QueryMode::Contains, contains)
        } else if let Some(handle) = &input.handle {
            (QueryMode::Handle, handle)
        } else {
            if input.index.is_some() || input.visible_only || input.frame_scope.is_some() {
                return Err(ActError::query(
                    QueryFailure::InvalidOptions,
                    "--index, --visible-only and --frame-scope need a query",
                )
                .with_hint("add --text, --selector or --contains"));
            }
            return Ok(None);
        };

        if raw.trim().is_empty() {
            return Err(ActError::query(
                QueryFailure::InvalidOptions,
                format!("--{} must not be empty", mode.as_str()),
            ));
        }

        if mode == QueryMode::Handle {
            let mut conflicting = Vec::new();
            if input.index.is_some() {
                conflicting.push("--index".to_string());
            }
            if input.visible_only {
                conflicting.push("--visible-only".to_string());
            }
            if input.frame_scope.is_some() {
                conflicting.push("--frame-scope".to_string());
            }
            if !conflicting.is_empty() {
                return Err(ActError::query(
                    QueryFailure::MutuallyExclusive,
                    format!("--handle cannot be combined with {}", conflicting.join(", ")),
                )
                .with_hint("a handle already names exactly one node; drop the other options")
                .with_query_context(|ctx| ctx.conflicting = conflicting));
            }
            let backend_node_id = parse_handle(raw)?;
            return Ok(Some(Query {
                mode,
                raw_query: raw.trim().to_string(),
                backend_node_id: Some(backend_node_id),
                index: None,
                visible_only: false,
                frame_scope: FrameScope::Main,
            }));
        }

        Ok(Some(Query {
            mode,
            raw_query: raw.clone(),
            backend_node_id: None,
            index: input.index,
            visible_only: input.visible_only,
            frame_scope: input.frame_scope.unwrap_or_default(),
        }))
    }

    pub fn is_handle(&self) -> bool {
        self.mode == QueryMode::Handle
    }

    /// Short human description, e.g. `text "Save"`.
    pub fn describe(&self) -> String {
        format!("{} {:?}", self.mode.as_str(), self.raw_query)
    }
}

/// `123` or `node:123`.
pub fn parse_handle(raw: &str) -> ActResult<i64> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("node:").unwrap_or(trimmed);
    match digits.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ActError::query(
            QueryFailure::InvalidHandle,
            format!("'{raw}' is not a backend node handle"),
        )
        .with_hint("handles look like 123 or node:123")),
    }
}
