use anyhow::{Context, Result};
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config as LogConfig, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::configure::AppConfig;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} [{l}] - {m}{n}";

/// Unknown names fall back to info
pub fn parse_level(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(LevelFilter::Info)
}

fn encoder() -> Box<PatternEncoder> {
    Box::new(PatternEncoder::new(PATTERN))
}

/// Console always; a file appender too when `log_to_file` is set.
/// Driver chatter from the Scylla client is capped at warn.
pub fn setup_logger(config: &AppConfig) -> Result<()> {
    let level = parse_level(&config.log_level);
    let mut appenders = vec!["stdout"];

    let stdout = ConsoleAppender::builder().encoder(encoder()).build();
    let mut builder = LogConfig::builder().appender(Appender::builder().build("stdout", Box::new(stdout)));

    if config.log_to_file {
        let file = FileAppender::builder()
            .encoder(encoder())
            .build(&config.log_file)
            .with_context(|| format!("Failed to open log file {}", config.log_file))?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file)));
        appenders.push("file");
    }

    let log_config = builder
        .logger(Logger::builder().build("scylla", level.min(LevelFilter::Warn)))
        .build(Root::builder().appenders(appenders).build(level))
        .context("Invalid logger configuration")?;
    log4rs::init_config(log_config).context("Logger already initialised")?;

    if config.log_to_file {
        log::info!("Logging to file: {}", config.log_file);
    }
    Ok(())
}
