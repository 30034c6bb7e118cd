// Copyright 2025 Penne Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0
//! Command-line arguments and their validation.

use clap::{Parser, ValueEnum};
use penne_core::key::KeyStrategy;
use penne_destinations::redis_stream::DEFAULT_STREAM;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Which source feeds the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Tail a MongoDB collection's change stream
    ChangeStream,
    /// Diff successive full reads of a MySQL table
    Poll,
}

/// Relay row-level changes from MongoDB or MySQL into a Redis stream.
#[derive(Debug, Parser)]
#[command(name = "penne", version, about)]
pub struct Cli {
    /// Capture mode
    #[arg(long, env = "PENNE_MODE", value_enum, default_value_t = Mode::ChangeStream)]
    pub mode: Mode,

    /// MongoDB connection string (change-stream mode)
    #[arg(long, env = "MONGO_URI")]
    pub mongo_uri: Option<String>,

    /// MongoDB database (change-stream mode)
    #[arg(long, env = "MONGO_DB", default_value = "cloth_store")]
    pub mongo_db: String,

    /// MongoDB collection (change-stream mode)
    #[arg(long, env = "MONGO_COLLECTION", default_value = "shirts")]
    pub mongo_collection: String,

    /// MySQL connection URL (poll mode)
    #[arg(long, env = "MYSQL_URL")]
    pub mysql_url: Option<String>,

    /// MySQL schema (poll mode)
    #[arg(long, env = "MYSQL_SCHEMA", default_value = "cloth_store")]
    pub mysql_schema: String,

    /// MySQL table (poll mode)
    #[arg(long, env = "MYSQL_TABLE", default_value = "shirts")]
    pub mysql_table: String,

    /// Key columns, comma separated; discovered from the primary key when omitted
    #[arg(long, env = "PENNE_KEY_COLUMNS", value_delimiter = ',')]
    pub key_columns: Vec<String>,

    /// Milliseconds between table reads (poll mode)
    #[arg(long, env = "PENNE_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Take the first table read as a silent baseline instead of inserts
    #[arg(long, env = "PENNE_SKIP_INITIAL_SNAPSHOT")]
    pub skip_initial_snapshot: bool,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Stream the changes are appended to
    #[arg(long, env = "REDIS_STREAM", default_value = DEFAULT_STREAM)]
    pub redis_stream: String,

    /// Approximate maximum stream length
    #[arg(long, env = "REDIS_STREAM_MAXLEN")]
    pub redis_stream_maxlen: Option<usize>,

    /// File holding the last resume position
    #[arg(long, env = "PENNE_CHECKPOINT_FILE", default_value = ".mongo_resume_token.ejson")]
    pub checkpoint_file: PathBuf,

    /// Keep the resume position in Redis under this slot instead of a file
    #[arg(long, env = "PENNE_CHECKPOINT_SLOT")]
    pub checkpoint_slot: Option<String>,

    /// Stop instead of blocking when the stream stays unavailable
    #[arg(long, env = "PENNE_FAIL_ON_SINK_OUTAGE")]
    pub fail_on_sink_outage: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "PENNE_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long, env = "PENNE_LOG_JSON")]
    pub log_json: bool,
}

/// Invalid or incomplete command-line configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value required by the selected mode is missing
    #[error("{name} is required in {mode} mode")]
    Missing {
        /// Flag or environment variable name
        name: &'static str,
        /// Selected mode
        mode: &'static str,
    },

    /// A value is present but unusable
    #[error("invalid {name}: {message}")]
    Invalid {
        /// Flag or environment variable name
        name: &'static str,
        /// What is wrong with it
        message: String,
    },
}

impl Cli {
    /// Checks the combination of arguments for the selected mode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            Mode::ChangeStream => {
                if self.mongo_uri.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::Missing {
                        name: "MONGO_URI",
                        mode: "change-stream",
                    });
                }
            }
            Mode::Poll => {
                if self.mysql_url.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::Missing {
                        name: "MYSQL_URL",
                        mode: "poll",
                    });
                }
                if self.poll_interval_ms == 0 {
                    return Err(ConfigError::Invalid {
                        name: "PENNE_POLL_INTERVAL_MS",
                        message: "must be greater than 0".to_string(),
                    });
                }
            }
        }

        if self.key_columns.iter().any(|c| c.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                name: "PENNE_KEY_COLUMNS",
                message: "column names must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Delay between table reads.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Key strategy override, if key columns were given.
    pub fn key_strategy(&self) -> Option<KeyStrategy> {
        if self.key_columns.is_empty() {
            None
        } else {
            let columns = self.key_columns.iter().map(|c| c.trim().to_string()).collect();
            Some(KeyStrategy::from_columns(columns))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("penne").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_change_stream_requires_mongo_uri() {
        let cli = parse(&["--mode", "change-stream", "--mongo-uri", ""]);
        assert!(matches!(
            cli.validate(),
            Err(ConfigError::Missing { name: "MONGO_URI", .. })
        ));

        let cli = parse(&["--mongo-uri", "mongodb://localhost:27017/?replicaSet=rs0"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_poll_mode_settings() {
        let cli = parse(&[
            "--mode",
            "poll",
            "--mysql-url",
            "mysql://root:pw@localhost:3306/cloth_store",
            "--poll-interval-ms",
            "250",
            "--key-columns",
            "id,size",
        ]);

        assert_eq!(cli.mode, Mode::Poll);
        assert!(cli.validate().is_ok());
        assert_eq!(cli.poll_interval(), Duration::from_millis(250));
        assert_eq!(
            cli.key_strategy(),
            Some(KeyStrategy::from_columns(vec!["id".to_string(), "size".to_string()]))
        );
    }

    #[test]
    fn test_poll_mode_rejects_zero_interval() {
        let cli = parse(&[
            "--mode",
            "poll",
            "--mysql-url",
            "mysql://localhost/cloth_store",
            "--poll-interval-ms",
            "0",
        ]);
        assert!(matches!(cli.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["penne", "--mode", "binlog"]).is_err());
    }
}
