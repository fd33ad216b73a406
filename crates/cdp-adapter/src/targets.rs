use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use soulact_core_types::TargetId;

use crate::error::{AdapterError, AdapterErrorKind};
use crate::transport::{CdpTransport, CommandTarget};

/// `Target.TargetInfo` subset the engine reads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: TargetId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
    #[serde(default)]
    pub opener_id: Option<TargetId>,
}

impl TargetInfo {
    pub fn is_page(&self) -> bool {
        self.kind == "page"
    }

    pub fn from_value(value: &Value) -> Result<Self, AdapterError> {
        serde_json::from_value(value.clone()).map_err(|err| {
            AdapterError::new(AdapterErrorKind::Protocol)
                .with_hint(format!("malformed target info: {err}"))
        })
    }
}

/// Every target the browser currently knows, in browser order.
pub async fn list_targets(transport: &dyn CdpTransport) -> Result<Vec<TargetInfo>, AdapterError> {
    let result = transport
        .send_command(CommandTarget::Browser, "Target.getTargets", json!({}))
        .await?;
    let infos = result["targetInfos"].as_array().ok_or_else(|| {
        AdapterError::new(AdapterErrorKind::Protocol)
            .with_method("Target.getTargets")
            .with_hint("response has no targetInfos")
    })?;
    infos
        .iter()
        .map(|info| TargetInfo::from_value(info).map_err(|err| err.with_method("Target.getTargets")))
        .collect()
}

/// Page targets only.
pub async fn list_pages(transport: &dyn CdpTransport) -> Result<Vec<TargetInfo>, AdapterError> {
    Ok(list_targets(transport)
        .await?
        .into_iter()
        .filter(TargetInfo::is_page)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;

    #[tokio::test]
    async fn lists_pages_and_keeps_opener() {
        let transport = ScriptedTransport::new();
        transport.on(
            "Target.getTargets",
            json!({ "targetInfos": [
                { "targetId": "P1", "type": "page", "title": "One", "url": "https://e.test/", "attached": true },
                { "targetId": "W1", "type": "service_worker", "title": "", "url": "https://e.test/sw.js", "attached": false },
                { "targetId": "P2", "type": "page", "title": "Two", "url": "https://e.test/2", "attached": false, "openerId": "P1" }
            ]}),
        );

        let all = list_targets(transport.as_ref()).await.unwrap();
        assert_eq!(all.len(), 3);

        let pages = list_pages(transport.as_ref()).await.unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].opener_id, Some(TargetId::from("P1")));
    }

    #[tokio::test]
    async fn missing_infos_is_protocol_error() {
        let transport = ScriptedTransport::new();
        let err = list_targets(transport.as_ref()).await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Protocol);
        assert_eq!(err.method.as_deref(), Some("Target.getTargets"));
    }
}
