//! # Reactor configuration & CLI
//!
//! JSON config shape (SPEC_FULL.md §6) and the `-c <config-path>` / `-v`
//! CLI contract, grounded on `servers/src/yahoo_logic/config.rs`'s
//! clap-derive-plus-JSON-overlay pattern.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::{IoError, IoResult};
use crate::reactor::ReactorLimits;

/// `-c <config-path>` selects this file; `-v` prints the version and
/// exits with [`VERSION_EXIT_CODE`] without touching any config path,
/// matching the CLI contract's "caller must not load a file named by
/// `-v`" rule.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "TLS/websocket reactor", long_about = None)]
pub struct Cli {
    /// Path to the reactor's JSON configuration file.
    #[clap(short = 'c', long = "config", env = "IO_REACTOR_CONFIG")]
    pub config_path: Option<PathBuf>,
}

/// The distinguished sentinel exit status used when `-v` is requested,
/// analogous to the original CLI's version-then-exit convention.
pub const VERSION_EXIT_CODE: i32 = 78;

#[derive(Debug, Deserialize)]
struct ReactorConfigFile {
    io: IoSection,
}

#[derive(Debug, Deserialize)]
struct IoSection {
    domain: DomainSection,
    #[serde(default)]
    limits: LimitsSection,
}

#[derive(Debug, Deserialize)]
struct DomainSection {
    path: PathBuf,
}

#[derive(Debug, Deserialize, Default)]
struct LimitsSection {
    #[serde(default = "default_reconnect_interval")]
    reconnect_interval_usec: u64,
    #[serde(default = "default_timeout")]
    timeout_usec: u64,
}

fn default_reconnect_interval() -> u64 {
    3_000_000
}

fn default_timeout() -> u64 {
    3_000_000
}

/// Parsed reactor configuration, ready to build a [`crate::domain::DomainRegistry`]
/// and a [`ReactorLimits`] from.
pub struct ReactorConfig {
    pub domain_dir: PathBuf,
    pub limits: ReactorLimits,
}

impl ReactorConfig {
    /// Loads and parses the JSON file at `path`.
    pub fn load(path: &std::path::Path) -> IoResult<ReactorConfig> {
        let text = std::fs::read_to_string(path)?;
        let file: ReactorConfigFile = serde_json::from_str(&text)?;
        Ok(ReactorConfig {
            domain_dir: file.io.domain.path,
            limits: ReactorLimits {
                accept_to_io_timeout_usec: file.io.limits.timeout_usec,
                io_timeout_usec: file.io.limits.timeout_usec,
                reconnect_interval_usec: file.io.limits.reconnect_interval_usec,
            },
        })
    }
}

/// Parses CLI args and, if `-c` was given, loads the config file it
/// names. Returns `Err` (a fatal configuration error per SPEC_FULL.md
/// §7) if a path was given but failed to load.
pub fn load_from_cli() -> IoResult<(Cli, Option<ReactorConfig>)> {
    let cli = Cli::parse();
    let config = match &cli.config_path {
        Some(path) => Some(ReactorConfig::load(path)?),
        None => None,
    };
    Ok((cli, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_documented_config_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reactor.json");
        std::fs::write(
            &path,
            r#"{ "io": { "domain": { "path": "/etc/ov/domains" },
                 "limits": { "reconnect_interval_usec": 3000000,
                             "timeout_usec": 3000000 } } }"#,
        )
        .unwrap();
        let config = ReactorConfig::load(&path).unwrap();
        assert_eq!(config.domain_dir, PathBuf::from("/etc/ov/domains"));
        assert_eq!(config.limits.reconnect_interval_usec, 3_000_000);
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let result = ReactorConfig::load(std::path::Path::new("/nonexistent/reactor.json"));
        assert!(matches!(result, Err(IoError::Io(_))));
    }
}
