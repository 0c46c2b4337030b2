//! Runtime configuration for the local repository and the import pipeline.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const TOPDIR_ENV: &str = "OCI2LOCAL_DIR";
pub const TAR_ENV: &str = "OCI2LOCAL_TAR";

/// Which extractor unpacks saved images and container layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// Spawn the external `tar` program.
    #[default]
    External,
    /// Unpack in-process with the `tar` crate.
    Builtin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub topdir: PathBuf,
    pub tar_program: String,
    pub extractor: ExtractorKind,
    pub verbose_extract: bool,
    /// Rename the imported tarball into the layers directory instead of copying it.
    pub move_tarball: bool,
    /// Register a layer that only made it into the repository through the copy fallback.
    pub register_copied_layers: bool,
    pub verbosity: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topdir: default_topdir(),
            tar_program: "tar".to_string(),
            extractor: ExtractorKind::External,
            verbose_extract: false,
            move_tarball: true,
            register_copied_layers: false,
            verbosity: 0,
        }
    }
}

fn default_topdir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".oci2local")
}

impl Config {
    /// Reads a JSON configuration file; missing keys keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Defaults with the `OCI2LOCAL_DIR` and `OCI2LOCAL_TAR` overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(dir) = std::env::var_os(TOPDIR_ENV).filter(|v| !v.is_empty()) {
            self.topdir = PathBuf::from(dir);
        }
        if let Ok(program) = std::env::var(TAR_ENV) {
            if !program.is_empty() {
                self.tar_program = program;
            }
        }
        self
    }

    pub fn with_topdir<P: Into<PathBuf>>(mut self, topdir: P) -> Self {
        self.topdir = topdir.into();
        self
    }
}
