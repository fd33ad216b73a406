use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

pub use error::*;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a browser session known to the state collaborator.
    SessionId
);
string_id!(
    /// CDP `targetId` of one tab/page.
    TargetId
);
string_id!(
    /// CDP `frameId`.
    FrameCdpId
);
string_id!(ActionId);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl ActionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// How the session used for an invocation was obtained.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionSource {
    Explicit,
    TargetInferred,
    ImplicitNew,
}

impl SessionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionSource::Explicit => "explicit",
            SessionSource::TargetInferred => "target-inferred",
            SessionSource::ImplicitNew => "implicit-new",
        }
    }
}

/// Browser connection descriptor borrowed for the duration of one invocation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub cdp_origin: String,
    pub session_source: SessionSource,
}

impl SessionHandle {
    pub fn new(session_id: SessionId, cdp_origin: impl Into<String>, source: SessionSource) -> Self {
        Self {
            session_id,
            cdp_origin: cdp_origin.into(),
            session_source: source,
        }
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session={} origin={} source={}",
            self.session_id,
            self.cdp_origin,
            self.session_source.as_str()
        )
    }
}

/// Verb executed by an invocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Click,
    Fill,
    Keypress,
    Upload,
    Download,
    Dialog,
    DragDrop,
    Spawn,
    Explain,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Fill => "fill",
            ActionKind::Keypress => "keypress",
            ActionKind::Upload => "upload",
            ActionKind::Download => "download",
            ActionKind::Dialog => "dialog",
            ActionKind::DragDrop => "drag-drop",
            ActionKind::Spawn => "spawn",
            ActionKind::Explain => "explain",
        }
    }

    /// Explain is a dry run and leaves the page untouched.
    pub fn mutates_page(&self) -> bool {
        !matches!(self, ActionKind::Explain)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_source_serializes_kebab_case() {
        let value = serde_json::to_value(SessionSource::TargetInferred).unwrap();
        assert_eq!(value, serde_json::json!("target-inferred"));
        assert_eq!(SessionSource::ImplicitNew.as_str(), "implicit-new");
    }

    #[test]
    fn session_handle_uses_camel_case_fields() {
        let handle = SessionHandle::new(
            SessionId::from("s-1"),
            "http://127.0.0.1:9222",
            SessionSource::Explicit,
        );
        let value = serde_json::to_value(&handle).unwrap();
        assert_eq!(value["sessionId"], "s-1");
        assert_eq!(value["cdpOrigin"], "http://127.0.0.1:9222");
        assert_eq!(value["sessionSource"], "explicit");
    }

    #[test]
    fn ids_are_transparent_strings() {
        let target = TargetId::from("ABC");
        assert_eq!(serde_json::to_string(&target).unwrap(), "\"ABC\"");
        assert_eq!(target.to_string(), "ABC");
    }

    #[test]
    fn drag_drop_kind_name() {
        assert_eq!(ActionKind::DragDrop.as_str(), "drag-drop");
        assert!(!ActionKind::Explain.mutates_page());
    }
}
