use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub preprocessing: PreprocessingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub static_dir: PathBuf,
    pub max_upload_bytes: usize,
    /// Keep serving static pages when the classifier could not be loaded.
    pub serve_without_model: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Relative paths are resolved against the executable's directory.
    pub path: PathBuf,
    pub format: ModelFormat,
    pub device: DeviceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Weights,
    Torchscript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Auto,
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub image_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            workers: None,
            static_dir: default_static_dir(),
            max_upload_bytes: 50 * 1024 * 1024,
            serve_without_model: false,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("best_model.pth"),
            format: ModelFormat::Weights,
            device: DeviceKind::Auto,
        }
    }
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

fn default_static_dir() -> PathBuf {
    match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(manifest_dir) => PathBuf::from(format!("{}/static", manifest_dir)),
        Err(_) => PathBuf::from("static"),
    }
}

fn default_config_path() -> PathBuf {
    match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(manifest_dir) => PathBuf::from(format!("{}/../config/server.yaml", manifest_dir)),
        Err(_) => PathBuf::from("config/server.yaml"),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}

fn parse_device(value: &str) -> Result<DeviceKind, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "auto" => Ok(DeviceKind::Auto),
        "cpu" => Ok(DeviceKind::Cpu),
        "cuda" => Ok(DeviceKind::Cuda),
        other => Err(ConfigError::InvalidValue(format!(
            "MODEL_DEVICE must be one of auto, cpu, cuda, got '{}'",
            other
        ))),
    }
}

impl AppConfig {
    /// Reads the YAML config (`PNEUMO_CONFIG` or `config/server.yaml`), then
    /// applies environment overrides. A missing file means defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("PNEUMO_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());

        let mut config = if path.exists() {
            log::info!("Loading configuration from {}", path.display());
            Self::from_file(&path)?
        } else {
            log::warn!(
                "No configuration file at {}, using built-in defaults",
                path.display()
            );
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(config_str)?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port.trim().parse().map_err(|_| {
                ConfigError::InvalidValue(format!("PORT must be a port number, got '{}'", port))
            })?;
        }
        if let Some(static_dir) = lookup("STATIC_DIR") {
            self.server.static_dir = PathBuf::from(static_dir);
        }
        if let Some(flag) = lookup("SERVE_WITHOUT_MODEL") {
            self.server.serve_without_model = parse_bool("SERVE_WITHOUT_MODEL", &flag)?;
        }
        if let Some(model_path) = lookup("MODEL_PATH") {
            self.model.path = PathBuf::from(model_path);
        }
        if let Some(device) = lookup("MODEL_DEVICE") {
            self.model.device = parse_device(&device)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preprocessing.image_size == 0 {
            return Err(ConfigError::InvalidValue(
                "preprocessing.image_size must be positive".into(),
            ));
        }
        if self.preprocessing.std.iter().any(|s| *s <= 0.0) {
            return Err(ConfigError::InvalidValue(
                "preprocessing.std entries must be positive".into(),
            ));
        }
        if self.server.max_upload_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "server.max_upload_bytes must be positive".into(),
            ));
        }
        if self.server.workers == Some(0) {
            return Err(ConfigError::InvalidValue(
                "server.workers must be positive when set".into(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
