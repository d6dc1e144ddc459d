use std::fs::read_to_string;

use anyhow::{anyhow, bail, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::error::LogUnitError;

pub static CONFIG: Lazy<parking_lot::RwLock<Configuration>> = Lazy::new(|| Default::default());

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Configuration {
    pub work_directory: Option<String>,

    /// Run on the ephemeral in-memory backend. Testing only.
    pub in_memory: Option<bool>,

    /// Write-through when true, write-back otherwise.
    pub sync_write: Option<bool>,

    pub max_cache_weight: Option<u64>,
    pub entries_per_segment: Option<u64>,
    pub gc_interval_secs: Option<u64>,
}

impl Configuration {
    pub fn parse_config_file(file: &str) -> Result<Configuration> {
        info!("parsing configuration file: {}", file);

        let file_contents = read_to_string(file).map_err(|_| {
            error!("failed to read configuration file {}", file);
            anyhow!(LogUnitError::FailedToRead)
        })?;

        let ret: Configuration = toml::from_str(&file_contents).map_err(|e| {
            error!("failed to parse configuration file: {}", e);
            anyhow!(LogUnitError::InvalidToml)
        })?;

        debug!("configuration: {:?}", ret);
        Ok(ret)
    }
}

fn validate_configuration(config: &Configuration) -> Result<()> {
    if !config.in_memory.unwrap_or(false) && config.work_directory.is_none() {
        bail!(LogUnitError::InvalidConfiguration(
            "work_directory is required unless in_memory is set".into()
        ));
    }

    if config.entries_per_segment == Some(0) {
        bail!(LogUnitError::InvalidConfiguration(
            "entries_per_segment must be positive".into()
        ));
    }

    if config.max_cache_weight == Some(0) {
        bail!(LogUnitError::InvalidConfiguration(
            "max_cache_weight must be positive".into()
        ));
    }

    Ok(())
}

pub fn config_mod_init(config_file: &str) -> Result<()> {
    let conf = Configuration::parse_config_file(config_file).map_err(|e| {
        error!("failed to initialize config module");
        e
    })?;

    validate_configuration(&conf)?;

    *CONFIG.write() = conf;

    info!("successfully initialized config module");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_config_parse() {
        let config_file1 = "tests/test_config/config1.toml";
        let config1_res = Configuration::parse_config_file(config_file1);
        assert!(config1_res.is_ok());

        let config1 = config1_res.unwrap();

        assert_eq!(config1.work_directory.unwrap(), "/var/lib/logunit");
        assert_eq!(config1.in_memory.unwrap(), false);
        assert_eq!(config1.sync_write.unwrap(), true);
        assert_eq!(config1.max_cache_weight.unwrap(), 1048576);
        assert_eq!(config1.entries_per_segment.unwrap(), 10000);
        assert_eq!(config1.gc_interval_secs.unwrap(), 60);
    }

    #[test]
    pub fn test_validation() {
        let mut config = Configuration::default();
        config.in_memory = Some(true);
        assert!(validate_configuration(&config).is_ok());

        // file-backed without a directory
        config.in_memory = Some(false);
        assert!(validate_configuration(&config).is_err());

        config.work_directory = Some("/var/lib/logunit".into());
        assert!(validate_configuration(&config).is_ok());

        config.entries_per_segment = Some(0);
        assert!(validate_configuration(&config).is_err());
    }
}
