use std::sync::Arc;
use std::time::Duration;

use action_primitives::{ActionPipeline, ChromiumConnector};
use clap::Parser;
use soulact_core_types::ActError;
use soulact_state_center::JsonStateStore;
use tracing::{debug, info};

use super::config::{load_config, LoadedConfig};
use super::env::CliArgs;
use super::output::{print_error, print_report};
use super::request::build_request;

/// Parses arguments, runs one invocation and returns the exit code.
pub async fn run() -> u8 {
    let cli = CliArgs::parse();

    if let Err(err) = super::runtime::init_logging(&cli.log_level, cli.debug, cli.log_format) {
        eprintln!("soulact: {err:#}");
    }
    debug!("soulact v{}", env!("CARGO_PKG_VERSION"));

    let LoadedConfig { mut config, path } = match load_config(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(err) => {
            let err = ActError::internal("config", format!("{err:#}"))
                .with_hint("check the file passed to --config");
            return print_error(&err, cli.pretty);
        }
    };
    if let Some(origin) = &cli.cdp {
        config.cdp_origin = origin.clone();
    }
    debug!(config_path = ?path, cdp_origin = %config.cdp_origin, "configuration ready");

    let request = match build_request(&cli.command, Duration::from_millis(config.default_timeout_ms)) {
        Ok(request) => request,
        Err(err) => return print_error(&err, cli.pretty),
    };

    let store = Arc::new(JsonStateStore::new(config.state_dir.clone()));
    let pipeline = ActionPipeline::new(store, Arc::new(ChromiumConnector), config.engine_config());

    match pipeline.run(&request).await {
        Ok(report) => {
            info!(action = %request.kind(), timing = ?report.timing(), "invocation finished");
            print_report(&report, cli.pretty);
            0
        }
        Err(err) => {
            info!(action = %request.kind(), code = err.code(), "invocation failed");
            print_error(&err, cli.pretty)
        }
    }
}
