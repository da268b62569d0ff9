use std::io::Write as _;

use anyhow::Result;
use chrono::{Local, SecondsFormat};
use env_logger::{Builder, Env};
use log::LevelFilter;

const LOG_ENV_VARIABLE: &str = "SIDECAR_LOG";

const DEFAULT_LEVELS: &[(&str, LevelFilter)] = &[
    ("binary_utils", LevelFilter::Info),
    ("database", LevelFilter::Info),
    ("p2p", LevelFilter::Info),
    ("prometheus_metrics", LevelFilter::Info),
    ("sidecar_store", LevelFilter::Info),
];

/// Initializes the global logger.
///
/// Crates of this workspace log at `info` by default, everything else is silenced. Directives in
/// `SIDECAR_LOG` take precedence over the defaults.
pub fn initialize_logger(module_path: &str, always_write_style: bool) -> Result<()> {
    logger_builder(module_path, always_write_style).try_init()?;
    Ok(())
}

fn logger_builder(module_path: &str, always_write_style: bool) -> Builder {
    let mut builder = Builder::new();

    builder.filter_level(LevelFilter::Off);

    for (module, level) in DEFAULT_LEVELS {
        builder.filter_module(module, *level);
    }

    builder
        .filter_module(module_path, LevelFilter::Info)
        .parse_env(Env::new().filter(LOG_ENV_VARIABLE))
        .format(|formatter, record| {
            writeln!(
                formatter,
                "[{}] {:<5} {}: {}",
                Local::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                record.level(),
                record.target(),
                record.args(),
            )
        });

    if always_write_style {
        builder.write_style(env_logger::WriteStyle::Always);
    }

    builder
}
