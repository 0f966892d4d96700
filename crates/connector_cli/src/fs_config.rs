//! Configuration extension reading a TOML file.
//!
//! The file location comes from `EDC_FS_CONFIG` and defaults to
//! `dataspace-configuration.toml` in the working directory. A missing
//! file yields an empty configuration.

use connector_core::{
    Config, ConfigFactory, ConfigResult, ConfigurationExtension, ManifestEntry, ManifestFactory,
    Monitor, EXTENSION_MANIFEST,
};
use std::path::{Path, PathBuf};

pub const CONFIG_LOCATION_ENV: &str = "EDC_FS_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "dataspace-configuration.toml";

#[linkme::distributed_slice(EXTENSION_MANIFEST)]
static FS_CONFIGURATION: ManifestEntry = ManifestEntry {
    name: "fs-configuration",
    factory: ManifestFactory::Configuration(|| {
        Box::new(FsConfigurationExtension::from_environment())
    }),
};

pub struct FsConfigurationExtension {
    path: PathBuf,
    config: Config,
}

impl FsConfigurationExtension {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: Config::default(),
        }
    }

    pub fn from_environment() -> Self {
        let path = std::env::var(CONFIG_LOCATION_ENV)
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigurationExtension for FsConfigurationExtension {
    fn name(&self) -> &str {
        "FS Configuration"
    }

    fn initialize(&mut self, monitor: &dyn Monitor) -> ConfigResult<()> {
        if !self.path.exists() {
            monitor.info(&format!(
                "Configuration file does not exist: {}. Ignoring.",
                self.path.display()
            ));
            return Ok(());
        }
        self.config = ConfigFactory::from_toml_file(&self.path)?;
        monitor.debug(&format!(
            "Configuration file {} loaded, {} setting(s)",
            self.path.display(),
            self.config.entries().len()
        ));
        Ok(())
    }

    fn config(&self) -> Config {
        self.config.clone()
    }
}
