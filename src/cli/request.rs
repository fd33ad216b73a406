//! Turns parsed arguments into an engine request.
//!
//! Only string-to-value conversions happen here; option combinations are
//! checked by the engine itself.

use std::time::Duration;

use action_gate::{AssertionSpec, EvidenceOptions};
use action_locator::{FrameScope, QueryInput};
use action_primitives::{ActionRequest, DialogArgs, DownloadArgs, UploadArgs, VerbArgs, WaitSpec};
use soulact_core_types::{ActError, ActResult, QueryFailure};

use super::commands::{CommonArgs, Commands};

/// `5s`, `750ms`, `1m 30s` or a bare number of milliseconds.
pub fn parse_duration(flag: &str, raw: &str) -> ActResult<Duration> {
    let raw = raw.trim();
    let parsed = match raw.parse::<u64>() {
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(_) => humantime::parse_duration(raw).map_err(|err| err.to_string()),
    };
    parsed.map_err(|err| {
        ActError::query(
            QueryFailure::InvalidOptions,
            format!("{flag} {raw:?} is not a duration: {err}"),
        )
        .with_hint("use a value such as 5s, 750ms or 2000")
    })
}

fn query_input(common: &CommonArgs) -> ActResult<QueryInput> {
    let args = &common.query;
    let frame_scope = args.frame_scope.as_deref().map(FrameScope::parse).transpose()?;
    Ok(QueryInput {
        text: args.text.clone(),
        selector: args.selector.clone(),
        contains: args.contains.clone(),
        handle: args.handle.clone(),
        index: args.index,
        visible_only: args.visible_only,
        frame_scope,
    })
}

fn verb_args(command: &Commands) -> ActResult<VerbArgs> {
    Ok(match command {
        Commands::Click(_) => VerbArgs::Click,
        Commands::Fill(args) => VerbArgs::Fill {
            value: args.value.clone(),
        },
        Commands::Keypress(args) => VerbArgs::Keypress {
            key: args.key.clone(),
        },
        Commands::Upload(args) => VerbArgs::Upload(UploadArgs {
            files: args.files.clone(),
            submit_selector: args.submit_selector.clone(),
            verify_selector: args.verify_selector.clone(),
            verify_text: args.verify_text.clone(),
            verify_filename_regex: args.verify_filename_regex.clone(),
            verify_timeout: args
                .verify_timeout
                .as_deref()
                .map(|raw| parse_duration("--verify-timeout", raw))
                .transpose()?,
        }),
        Commands::Download(args) => VerbArgs::Download(DownloadArgs {
            out_dir: args.out_dir.clone(),
            fallback: !args.no_fallback,
        }),
        Commands::Dialog(args) => VerbArgs::Dialog(DialogArgs {
            accept: args.accept,
            dismiss: args.dismiss,
            prompt_text: args.prompt_text.clone(),
        }),
        Commands::DragDrop(args) => VerbArgs::DragDrop {
            source: args.source.clone(),
            target: args.target.clone(),
        },
        Commands::Spawn(_) => VerbArgs::Spawn,
        Commands::Explain(_) => VerbArgs::Explain,
    })
}

/// Builds the request; `default_timeout` applies when `--timeout` is absent.
pub fn build_request(command: &Commands, default_timeout: Duration) -> ActResult<ActionRequest> {
    let common = command.common();
    let mut request = ActionRequest::new(verb_args(command)?, query_input(common)?);

    request.timeout = match common.wait.timeout.as_deref() {
        Some(raw) => parse_duration("--timeout", raw)?,
        None => default_timeout,
    };
    request.wait = WaitSpec {
        text: common.wait.wait_for_text.clone(),
        selector: common.wait.wait_for_selector.clone(),
        network_idle: common.wait.wait_network_idle,
    };

    let evidence = &common.evidence;
    request.evidence = EvidenceOptions {
        snapshot: evidence.snapshot,
        delta: evidence.delta,
        proof: evidence.proof,
        aria_attrs: evidence.aria_attrs.clone(),
    };
    request.assertions = AssertionSpec {
        url_contains: evidence.assert_url_contains.clone(),
        title_contains: evidence.assert_title_contains.clone(),
        text: evidence.assert_text.clone(),
        selector: evidence.assert_selector.clone(),
        count: evidence.assert_count,
    };

    let (session, target) = command.session();
    request.session = session;
    request.target = target;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::env::CliArgs;
    use clap::Parser;

    fn build(args: &[&str]) -> ActResult<ActionRequest> {
        let cli = CliArgs::try_parse_from(args).unwrap();
        build_request(&cli.command, Duration::from_millis(5_000))
    }

    #[test]
    fn durations_accept_units_and_bare_milliseconds() {
        assert_eq!(parse_duration("--timeout", "750ms").unwrap(), Duration::from_millis(750));
        assert_eq!(parse_duration("--timeout", "2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("--timeout", " 1500 ").unwrap(), Duration::from_millis(1500));

        let err = parse_duration("--timeout", "soon").unwrap_err();
        assert_eq!(err.code(), "E_QUERY_INVALID");
        assert_eq!(err.query_reason(), Some(QueryFailure::InvalidOptions));
        assert!(err.message().contains("--timeout"));
    }

    #[test]
    fn click_request_carries_every_option_group() {
        let request = build(&[
            "soulact",
            "click",
            "--text",
            "Save",
            "--index",
            "1",
            "--frame-scope",
            "all",
            "--wait-for-text",
            "Saved",
            "--timeout",
            "3s",
            "--delta",
            "--aria-attr",
            "aria-busy",
            "--assert-url-contains",
            "/done",
            "--session",
            "s-1",
            "--target",
            "T-9",
        ])
        .unwrap();

        assert_eq!(request.verb, VerbArgs::Click);
        assert_eq!(request.query.text.as_deref(), Some("Save"));
        assert_eq!(request.query.index, Some(1));
        assert_eq!(request.query.frame_scope, Some(FrameScope::All));
        assert_eq!(request.wait.text.as_deref(), Some("Saved"));
        assert_eq!(request.timeout, Duration::from_secs(3));
        assert!(request.evidence.delta);
        assert_eq!(request.evidence.aria_attrs, vec!["aria-busy".to_string()]);
        assert_eq!(request.assertions.url_contains.as_deref(), Some("/done"));
        assert_eq!(request.session.as_deref(), Some("s-1"));
        assert_eq!(request.target.as_deref(), Some("T-9"));
    }

    #[test]
    fn default_timeout_applies_without_flag() {
        let request = build(&["soulact", "keypress", "--key", "Enter"]).unwrap();
        assert_eq!(request.timeout, Duration::from_millis(5_000));
        assert_eq!(
            request.verb,
            VerbArgs::Keypress {
                key: "Enter".to_string()
            }
        );
    }

    #[test]
    fn drag_drop_target_is_a_selector() {
        let request = build(&[
            "soulact",
            "drag-drop",
            "--source",
            "#card",
            "--target",
            "#lane",
            "--target-id",
            "T-2",
        ])
        .unwrap();
        assert_eq!(
            request.verb,
            VerbArgs::DragDrop {
                source: "#card".to_string(),
                target: "#lane".to_string()
            }
        );
        assert_eq!(request.target.as_deref(), Some("T-2"));
    }

    #[test]
    fn download_and_upload_flags_map_to_verb_args() {
        let request = build(&["soulact", "download", "--text", "Report", "--no-fallback"]).unwrap();
        assert_eq!(
            request.verb,
            VerbArgs::Download(DownloadArgs {
                out_dir: None,
                fallback: false
            })
        );

        let request = build(&[
            "soulact",
            "upload",
            "--selector",
            "input[type=file]",
            "--file",
            "a.txt",
            "--file",
            "b.txt",
            "--verify-text",
            "a.txt",
            "--verify-timeout",
            "2s",
        ])
        .unwrap();
        let VerbArgs::Upload(upload) = request.verb else {
            panic!("expected upload");
        };
        assert_eq!(upload.files.len(), 2);
        assert_eq!(upload.verify_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn unknown_frame_scope_is_rejected() {
        let err = build(&["soulact", "click", "--text", "A", "--frame-scope", "iframes"]).unwrap_err();
        assert_eq!(err.query_reason(), Some(QueryFailure::InvalidOptions));
    }
}
