// Copyright 2024. The Tari Project

use anyhow::{anyhow, Result};
use log::LevelFilter;
use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Config, Logger, Root},
    encode::pattern::PatternEncoder,
};
use std::path::Path;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {h({l:5})} [{t}] {m}{n}";

/// Dependencies that log every request at info level
const NOISY_TARGETS: [&str; 3] = ["hyper", "hyper_util", "reqwest"];

fn build_config(level: LevelFilter, log_file: Option<&Path>) -> Result<Config> {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    let mut builder = Config::builder().appender(Appender::builder().build("stdout", Box::new(stdout)));
    let mut root = Root::builder().appender("stdout");

    if let Some(path) = log_file {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build(path)?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }

    for target in NOISY_TARGETS {
        builder = builder.logger(Logger::builder().build(target, LevelFilter::Warn));
    }

    Ok(builder.build(root.build(level))?)
}

/// Install the global logger. `level` is a `log` level name such as `info`.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let level: LevelFilter = level
        .parse()
        .map_err(|_| anyhow!("unknown log level {:?}", level))?;
    log4rs::init_config(build_config(level, log_file)?).map_err(|e| anyhow!("failed to install logger: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_only_config() {
        let config = build_config(LevelFilter::Debug, None).unwrap();
        assert_eq!(config.root().level(), LevelFilter::Debug);
        assert_eq!(config.root().appenders().to_vec(), vec!["stdout".to_string()]);
        assert_eq!(config.loggers().len(), NOISY_TARGETS.len());
    }

    #[test]
    fn test_file_appender_added() {
        let path = std::env::temp_dir().join(format!("teamup-realtime-{}.log", uuid::Uuid::new_v4()));
        let config = build_config(LevelFilter::Info, Some(&path)).unwrap();
        assert_eq!(
            config.root().appenders().to_vec(),
            vec!["stdout".to_string(), "file".to_string()]
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_unknown_level_rejected() {
        assert!(init_logging("chatty", None).is_err());
    }
}
