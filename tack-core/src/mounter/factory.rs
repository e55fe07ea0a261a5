//! Mounter factory.

use crate::error::{Result, TackError};
use crate::mounter::{DiskMounter, ImountMounter};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument};

/// Configuration for mounter selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MounterConfig {
    /// Helper program to drive
    pub program: PathBuf,

    /// Arguments passed before every subcommand
    pub extra_args: Vec<String>,
}

impl Default for MounterConfig {
    fn default() -> Self {
        Self { program: PathBuf::from("imount"), extra_args: Vec::new() }
    }
}

/// Factory for creating disk mounters.
pub struct MounterFactory;

impl MounterFactory {
    /// Create the mounter described by `config`.
    ///
    /// # Errors
    ///
    /// Returns error if the configured program path is empty.
    #[instrument(skip(config), fields(program = %config.program.display()))]
    pub fn create(config: &MounterConfig) -> Result<Arc<dyn DiskMounter>> {
        if config.program.as_os_str().is_empty() {
            return Err(TackError::InvalidConfig {
                reason: "mounter.program must not be empty".to_string(),
            });
        }

        info!("Using helper-program mounter");
        Ok(Arc::new(ImountMounter::new(config.program.clone(), config.extra_args.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_default() {
        let mounter = MounterFactory::create(&MounterConfig::default()).unwrap();
        assert_eq!(mounter.name(), "imount");
    }

    #[test]
    fn test_create_rejects_empty_program() {
        let config = MounterConfig { program: PathBuf::new(), extra_args: vec![] };
        assert!(MounterFactory::create(&config).is_err());
    }
}
