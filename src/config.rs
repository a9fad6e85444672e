// Run configuration, loaded from a RON file. Everything is optional and
// defaulted, so `flint run file.fl` needs no config at all.

use std::fs::File;

use ron::de::from_reader;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config file: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    // Write a per-instruction dispatch trace to stderr.
    pub trace: bool,
    pub jit: JitConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct JitConfig {
    pub enabled: bool,
    // Calls before a function is considered warm.
    pub threshold: u32,
}

impl Default for JitConfig {
    fn default() -> JitConfig {
        JitConfig {
            enabled: false,
            threshold: 100,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let file = File::open(path)?;
        Ok(from_reader(file)?)
    }
}
