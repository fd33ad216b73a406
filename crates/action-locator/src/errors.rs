//! Mapping of protocol failures into the public taxonomy

use cdp_adapter::{AdapterError, AdapterErrorKind};
use soulact_core_types::{ActError, FrameCdpId};

/// Wraps an adapter failure as `E_INTERNAL`, keeping the CDP method.
pub fn internal(operation: &str, err: AdapterError) -> ActError {
    let retry_hint = match err.kind {
        AdapterErrorKind::Timeout => Some("the browser did not answer in time; retry the action"),
        AdapterErrorKind::CdpIo | AdapterErrorKind::Discovery => {
            Some("check that the browser is still running with remote debugging enabled")
        }
        _ => None,
    };
    let mut act = ActError::internal(operation, format!("{operation} failed: {err}"))
        .with_internal_context(|ctx| {
            ctx.cdp_method = err.method.clone();
            ctx.detail = err.hint.clone();
        });
    if let Some(hint) = retry_hint {
        act = act.with_hint(hint);
    }
    act
}

/// As [`internal`], also naming the frame the operation ran in.
pub fn internal_in_frame(operation: &str, frame: &FrameCdpId, err: AdapterError) -> ActError {
    internal(operation, err).with_internal_context(|ctx| ctx.frame_id = Some(frame.to_string()))
}

/// `.or_internal("op")` on adapter results.
pub trait AdapterResultExt<T> {
    fn or_internal(self, operation: &str) -> Result<T, ActError>;
}

impl<T> AdapterResultExt<T> for Result<T, AdapterError> {
    fn or_internal(self, operation: &str) -> Result<T, ActError> {
        self.map_err(|err| internal(operation, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_method_and_frame() {
        let err = AdapterError::new(AdapterErrorKind::Protocol)
            .with_method("DOM.getBoxModel")
            .with_hint("Could not compute box model.");
        let act = internal_in_frame("click", &"F1".into(), err);
        assert_eq!(act.code(), "E_INTERNAL");
        match act {
            ActError::Internal { context, .. } => {
                assert_eq!(context.operation, "click");
                assert_eq!(context.cdp_method.as_deref(), Some("DOM.getBoxModel"));
                assert_eq!(context.frame_id.as_deref(), Some("F1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn timeouts_get_a_retry_hint() {
        let result: Result<(), AdapterError> = Err(AdapterError::new(AdapterErrorKind::Timeout));
        let act = result.or_internal("summary").unwrap_err();
        assert_eq!(act.hints().len(), 1);
    }
}
