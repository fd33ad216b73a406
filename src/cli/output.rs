use std::io::Write;

use action_primitives::Report;
use clap::ValueEnum;
use serde::Serialize;
use soulact_core_types::ActError;
use tracing::error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Last-resort document when the real one cannot be serialized.
const SERIALIZE_FAILURE: &str =
    r#"{"ok":false,"code":"E_INTERNAL","message":"failed to serialize result","hints":[],"hintContext":{"operation":"output"}}"#;

fn render<T: Serialize>(value: &T, pretty: bool) -> String {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    rendered.unwrap_or_else(|err| {
        error!(error = %err, "failed to serialize result");
        SERIALIZE_FAILURE.to_string()
    })
}

fn emit(document: String) {
    let mut stdout = std::io::stdout().lock();
    if let Err(err) = writeln!(stdout, "{document}").and_then(|_| stdout.flush()) {
        error!(error = %err, "failed to write result");
    }
}

pub fn print_report(report: &Report, pretty: bool) {
    emit(render(report, pretty));
}

/// Prints the failure envelope and returns the process exit code.
pub fn print_error(err: &ActError, pretty: bool) -> u8 {
    emit(render(&err.envelope(), pretty));
    exit_code(err)
}

pub fn exit_code(err: &ActError) -> u8 {
    u8::try_from(err.exit_code()).unwrap_or(1)
}
