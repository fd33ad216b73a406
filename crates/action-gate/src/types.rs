//! Core types for post-action evidence

use std::collections::BTreeMap;

use action_locator::ops::FocusState;
use serde::{Deserialize, Serialize};

/// ARIA attributes tracked on the acted-on element by default.
pub const DEFAULT_ARIA_ATTRS: &[&str] = &["aria-expanded", "aria-pressed", "aria-checked", "aria-selected"];

/// Visible landmark roles counted in every state capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCounts {
    pub dialog: u32,
    pub alert: u32,
    pub status: u32,
    pub menu: u32,
    pub listbox: u32,
}

/// Page-level state captured before or after an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageState {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub ready_state: String,
    pub focus: FocusState,
    pub role_counts: RoleCounts,
}

/// Before/after values of one attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttrChange {
    pub before: Option<String>,
    pub after: Option<String>,
    pub changed: bool,
}

/// Named attributes of the acted-on element across the action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AriaDelta {
    pub attrs: BTreeMap<String, AttrChange>,
    /// The element left the document during the action.
    pub detached: bool,
}

/// State diff around one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub before: PageState,
    pub after: PageState,
    pub url_changed: bool,
    pub title_changed: bool,
    pub focus_changed: bool,
    pub role_counts_changed: bool,
    pub aria: Option<AriaDelta>,
}

impl Delta {
    pub fn new(before: PageState, after: PageState, aria: Option<AriaDelta>) -> Self {
        Self {
            url_changed: before.url != after.url,
            title_changed: before.title != after.title,
            focus_changed: before.focus != after.focus,
            role_counts_changed: before.role_counts != after.role_counts,
            before,
            after,
            aria,
        }
    }
}

/// Caller assertions checked after the action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssertionSpec {
    pub url_contains: Option<String>,
    pub title_contains: Option<String>,
    pub text: Option<String>,
    pub selector: Option<String>,
    /// Expected number of `selector` matches.
    pub count: Option<usize>,
}

impl AssertionSpec {
    pub fn is_empty(&self) -> bool {
        self.url_contains.is_none()
            && self.title_contains.is_none()
            && self.text.is_none()
            && self.selector.is_none()
            && self.count.is_none()
    }
}
