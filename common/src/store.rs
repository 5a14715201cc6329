use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::config::{Config, ConfigError, PersistedConfig};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("stored config is invalid: {0}")]
    Invalid(#[from] ConfigError),
    #[error("config storage backend failed: {0}")]
    Backend(String),
}

/// Persistence for the node [`Config`]. `load` returns `Ok(None)` when
/// nothing has been stored yet.
pub trait ConfigStore {
    fn load(&mut self) -> Result<Option<Config>, StoreError>;
    fn save(&mut self, config: &Config) -> Result<(), StoreError>;
}

impl<T: ConfigStore + ?Sized> ConfigStore for Box<T> {
    fn load(&mut self) -> Result<Option<Config>, StoreError> {
        (**self).load()
    }

    fn save(&mut self, config: &Config) -> Result<(), StoreError> {
        (**self).save(config)
    }
}

pub fn decode_config(raw: &[u8]) -> Result<Config, StoreError> {
    let persisted = serde_json::from_slice::<PersistedConfig>(raw)?;
    Ok(Config::try_from(persisted)?)
}

pub fn encode_config(config: &Config) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec_pretty(&config.to_persisted())?)
}

/// Stores the config as a JSON document on the local filesystem. Every save
/// rewrites the whole file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub const FILE_NAME: &'static str = "config.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&mut self) -> Result<Option<Config>, StoreError> {
        match fs::read(&self.path) {
            Ok(raw) => decode_config(&raw).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&mut self, config: &Config) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, encode_config(config)?)?;
        Ok(())
    }
}
