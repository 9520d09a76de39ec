use serde::Deserialize;
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database
    pub database_path: PathBuf,
    pub api: ApiConfig,
    pub import: ImportConfig,
    pub export: ExportConfig,
    pub notification: NotificationConfig,
}

/// Clearinghouse API access
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub version: String,
    pub api_key: Option<String>,
    pub private_key: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

/// Provider files pushed to the Clearinghouse
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub enabled: bool,
    pub import_folder: Option<PathBuf>,
    /// Where processed files are moved. Files stay in place when unset.
    pub completed_folder: Option<PathBuf>,
    pub mapping_file: Option<PathBuf>,
    pub normalization_file: Option<PathBuf>,
}

/// Clearinghouse changes written out as provider files
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub enabled: bool,
    pub export_folder: Option<PathBuf>,
    pub mapping_file: Option<PathBuf>,
    pub normalization_file: Option<PathBuf>,
}

/// SMTP settings for error notifications
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: String,
    /// Recipients. Notifications are only logged when empty.
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("adapter").join("adapter.db"),
            api: ApiConfig::default(),
            import: ImportConfig::default(),
            export: ExportConfig::default(),
            notification: NotificationConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            version: "v1".to_string(),
            api_key: None,
            private_key: None,
            timeout_secs: 60,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 587,
            user: None,
            password: None,
            from: "noreply@rideconnection.org".to_string(),
            to: Vec::new(),
            subject: "Clearinghouse Adapter notification".to_string(),
            body: "The Clearinghouse Adapter has generated the following notification:".to_string(),
        }
    }
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            config = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("ADAPTER_DATABASE_PATH") {
            config.database_path = PathBuf::from(db_path);
        }
        if let Ok(url) = std::env::var("ADAPTER_API_URL") {
            config.api.base_url = Some(url);
        }
        if let Ok(key) = std::env::var("ADAPTER_API_KEY") {
            config.api.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("ADAPTER_API_PRIVATE_KEY") {
            config.api.private_key = Some(key);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that every enabled processor has its folder.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.import.enabled && self.import.import_folder.is_none() {
            return Err(ConfigError::MissingSetting("import.import_folder"));
        }
        if self.export.enabled && self.export.export_folder.is_none() {
            return Err(ConfigError::MissingSetting("export.export_folder"));
        }
        Ok(())
    }

    /// Default config file path: <config dir>/adapter/config.yaml
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("adapter")
            .join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    MissingSetting(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    e
                )
            }
            ConfigError::MissingSetting(name) => {
                write!(f, "Missing required setting '{}'", name)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
