//! Connector launcher.
//!
//! # Responsibility
//! - Install process logging from `EDC_LOG_LEVEL` and `EDC_LOG_DIR`.
//! - Boot the runtime over the static manifest and block until shutdown.

mod fs_config;

use connector_core::{default_log_level, init_logging, BaseRuntime};
use std::process::ExitCode;

const LOG_LEVEL_ENV: &str = "EDC_LOG_LEVEL";
const LOG_DIR_ENV: &str = "EDC_LOG_DIR";

fn main() -> ExitCode {
    let level =
        std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| default_log_level().to_string());
    let log_dir = std::env::var(LOG_DIR_ENV).ok();
    if let Err(err) = init_logging(&level, log_dir.as_deref()) {
        eprintln!("connector: {err}");
        return ExitCode::FAILURE;
    }

    let mut runtime = BaseRuntime::new();
    match runtime.boot() {
        Ok(handle) => {
            log::info!(
                "event=runtime_ready module=cli connector_id={}",
                handle.context().connector_id()
            );
            handle.wait_for_shutdown();
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}
