// File: config.rs
//
// The purpose of this file is to load the node's JSON configuration
// file and turn its settings into runtime pieces.

use crate::error::{Error, Result};
use crate::metric::{Md5Metric, Metric, TrivialMetric};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Settings recognized in the configuration file. Every key is
/// optional; missing ones take the defaults below.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port the RPC endpoint binds on.
    pub port: u16,
    /// Ring identifier; absent means a random one.
    pub node_id: Option<u128>,
    /// Peer URLs to try joining through at startup.
    pub cloud_members: Vec<String>,
    /// Ring metric name: "md5" or "trivial" (case-insensitive).
    pub metric: String,
    /// Predecessor monitor period, in seconds.
    pub heartbeat: u64,
    /// Log each served RPC at info level.
    pub log_requests: bool,
    /// Log each outbound RPC at debug level.
    pub proxy_verbose: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 10000,
            node_id: None,
            cloud_members: Vec::new(),
            metric: String::from("md5"),
            heartbeat: 10,
            log_requests: false,
            proxy_verbose: false,
        }
    }
}

impl Config {
    /// Loads a JSON configuration file
    ///
    /// # Arguments
    ///
    /// * `path` - the configuration file to read
    pub fn load(path: &Path) -> Result<Config> {
        let file = File::open(path)
            .map_err(|e| Error::Config(format!("unable to open {}: {}", path.display(), e)))?;
        serde_json::from_reader(file)
            .map_err(|e| Error::Config(format!("unable to parse {}: {}", path.display(), e)))
    }

    /// Builds the configured ring metric.
    pub fn metric(&self) -> Result<Arc<dyn Metric>> {
        match self.metric.to_lowercase().as_str() {
            "md5" => Ok(Arc::new(Md5Metric::default())),
            "trivial" => Ok(Arc::new(TrivialMetric::new(4))),
            other => Err(Error::Config(format!("unrecognized metric {:?}", other))),
        }
    }
}
