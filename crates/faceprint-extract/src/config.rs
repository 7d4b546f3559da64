use faceprint_core::{Backend, ModelPaths};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DATA_DIR: &str = "data";
const LOCAL_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid FACEPRINT_BACKEND: {0}")]
    InvalidBackend(String),
    #[error("invalid DB_PORT '{0}'")]
    InvalidPort(String),
    #[error("DB_HOST '{0}' is not local; the SQLite store only opens databases on this machine")]
    RemoteHost(String),
}

/// Connection settings of the application database.
///
/// The store is a SQLite file: the host must be local and the database name
/// selects `data/<name>.db` unless `FACEPRINT_DB_PATH` names a file directly.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    /// Explicit database file, overriding the one derived from `name`.
    pub file: Option<PathBuf>,
}

impl DatabaseConfig {
    /// Database file the store opens.
    pub fn path(&self) -> PathBuf {
        match &self.file {
            Some(file) => file.clone(),
            None => Path::new(DATA_DIR).join(format!("{}.db", self.name)),
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("file", &self.file)
            .finish()
    }
}

/// Extractor configuration, loaded once from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    /// Directory holding uploaded face images, addressed by base file name.
    pub upload_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Encoder used for this run.
    pub backend: Backend,
}

impl Config {
    /// Load configuration from `DB_*` and `FACEPRINT_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let path = |key: &str, default: &str| PathBuf::from(text(key, default));

        let backend = match lookup("FACEPRINT_BACKEND") {
            Some(value) => value.parse().map_err(ConfigError::InvalidBackend)?,
            None => Backend::Quantized,
        };

        let host = text("DB_HOST", "localhost");
        if !LOCAL_HOSTS.contains(&host.as_str()) {
            return Err(ConfigError::RemoteHost(host));
        }
        let raw_port = text("DB_PORT", "5432");
        let port = raw_port
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(raw_port.clone()))?;

        let database = DatabaseConfig {
            host,
            port,
            name: text("DB_NAME", "tia_db"),
            user: text("DB_USER", "postgres"),
            password: text("DB_PASSWORD", "postgres"),
            file: lookup("FACEPRINT_DB_PATH").map(PathBuf::from),
        };

        Ok(Self {
            database,
            upload_dir: path("FACEPRINT_UPLOAD_DIR", "uploads/faces"),
            model_dir: path("FACEPRINT_MODEL_DIR", "models"),
            backend,
        })
    }

    /// Model asset paths under the model directory.
    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths {
            detector: self.model_dir.join("det_500m.onnx"),
            holistic: self.model_dir.join("face_recognition_sface.onnx"),
            quantized: self.model_dir.join("mobilefacenet.onnx"),
        }
    }
}

#[cfg(test)]
pub(crate) fn config_with(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
    let vars: std::collections::HashMap<String, String> =
        vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Config::from_lookup(|key| vars.get(key).cloned())
}
