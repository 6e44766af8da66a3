//! Configuration management for zipdrop.
//! Supports INI files with CLI argument overrides.

pub mod ini_parser;

use crate::cli::Cli;
use crate::error::AppError;
use crate::storage::DEFAULT_CHUNK_SIZE;
use crate::validation::{DEFAULT_ALLOWED_MIME_TYPES, DEFAULT_MAX_FILE_SIZE};
use ini_parser::IniConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3500;
pub const DEFAULT_THREADS: usize = 8;
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub const DEFAULT_FILE_FIELD: &str = "file";
/// Seconds
pub const DEFAULT_READ_TIMEOUT: u64 = 30;

/// Immutable service configuration, built once at startup and shared by
/// reference with every component that needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    // Server settings
    pub listen: String,
    pub port: u16,
    pub threads: usize,
    /// `None` disables the stalled-read timeout
    pub read_timeout: Option<Duration>,

    // Upload settings
    pub upload_dir: PathBuf,
    pub max_file_size: u64,
    pub file_field: String,
    pub allowed_mime_types: Vec<String>,
    pub chunk_size: usize,

    pub cors: bool,

    // Logging settings
    pub verbose: bool,
    pub detailed_logging: bool,

    /// INI file the settings were read from, if any
    pub config_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            port: DEFAULT_PORT,
            threads: DEFAULT_THREADS,
            read_timeout: Some(Duration::from_secs(DEFAULT_READ_TIMEOUT)),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            file_field: DEFAULT_FILE_FIELD.to_string(),
            allowed_mime_types: DEFAULT_ALLOWED_MIME_TYPES
                .iter()
                .map(|m| m.to_string())
                .collect(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            cors: true,
            verbose: false,
            detailed_logging: false,
            config_file: None,
        }
    }
}

impl Config {
    /// Load configuration with precedence: CLI args > INI file > defaults.
    ///
    /// Runs before logging is set up, so nothing is logged here; the file
    /// used is recorded in `config_file`.
    pub fn load(cli: &Cli) -> Result<Self, AppError> {
        let config_file = Self::find_config_file(cli)?;
        let ini = match config_file {
            Some(ref path) => {
                IniConfig::load_file(path).map_err(AppError::InvalidConfiguration)?
            }
            None => IniConfig::new(),
        };

        let config = Self {
            config_file,
            ..Self::from_sources(cli, &ini)
        };
        config.validate()?;
        Ok(config)
    }

    /// Merge an already parsed INI file with the CLI
    pub fn from_sources(cli: &Cli, ini: &IniConfig) -> Self {
        let defaults = Self::default();

        let read_timeout_secs = cli
            .read_timeout
            .or_else(|| ini.get_u64("server", "read_timeout"))
            .unwrap_or(DEFAULT_READ_TIMEOUT);

        let allowed_mime_types = {
            let from_ini = ini.get_list("upload", "allowed_types");
            if from_ini.is_empty() {
                defaults.allowed_mime_types
            } else {
                from_ini
            }
        };

        Self {
            listen: cli
                .listen
                .clone()
                .or_else(|| ini.get_string("server", "listen"))
                .unwrap_or(defaults.listen),
            port: cli
                .port
                .or_else(|| ini.get_u16("server", "port"))
                .unwrap_or(defaults.port),
            threads: cli
                .threads
                .or_else(|| ini.get_usize("server", "threads"))
                .unwrap_or(defaults.threads),
            read_timeout: (read_timeout_secs > 0).then(|| Duration::from_secs(read_timeout_secs)),

            upload_dir: cli
                .upload_dir
                .clone()
                .or_else(|| ini.get_string("upload", "directory").map(PathBuf::from))
                .unwrap_or(defaults.upload_dir),
            max_file_size: cli
                .max_file_size
                .map(|mb| mb * 1024 * 1024)
                .or_else(|| ini.get_file_size("upload", "max_size"))
                .unwrap_or(defaults.max_file_size),
            file_field: ini
                .get_string("upload", "field")
                .unwrap_or(defaults.file_field),
            allowed_mime_types,
            chunk_size: cli
                .chunk_size
                .or_else(|| ini.get_usize("upload", "chunk_size"))
                .unwrap_or(defaults.chunk_size),

            cors: cli
                .cors
                .or_else(|| ini.get_bool("cors", "enabled"))
                .unwrap_or(defaults.cors),

            verbose: cli
                .verbose
                .or_else(|| ini.get_bool("logging", "verbose"))
                .unwrap_or(defaults.verbose),
            detailed_logging: cli
                .detailed_logging
                .or_else(|| ini.get_bool("logging", "detailed"))
                .unwrap_or(defaults.detailed_logging),

            config_file: None,
        }
    }

    /// Find configuration file in order of preference
    fn find_config_file(cli: &Cli) -> Result<Option<PathBuf>, AppError> {
        if let Some(ref config_path) = cli.config_file {
            let path = PathBuf::from(config_path);
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(AppError::invalid_configuration(format!(
                "Config file specified but not found: {config_path}"
            )));
        }

        for candidate in ["zipdrop.ini", "zipdrop.conf"] {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Ok(Some(path));
            }
        }

        if let Some(home_dir) = std::env::var_os("HOME") {
            let user_config = Path::new(&home_dir)
                .join(".config")
                .join("zipdrop")
                .join("config.ini");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        #[cfg(unix)]
        {
            let system_config = PathBuf::from("/etc/zipdrop/config.ini");
            if system_config.exists() {
                return Ok(Some(system_config));
            }
        }

        Ok(None)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.threads == 0 {
            return Err(AppError::invalid_configuration("threads must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(AppError::invalid_configuration(
                "chunk_size must be at least 1 byte",
            ));
        }
        if self.max_file_size == 0 {
            return Err(AppError::invalid_configuration(
                "max_size must be greater than 0",
            ));
        }
        if self.allowed_mime_types.is_empty() {
            return Err(AppError::invalid_configuration(
                "allowed_types must name at least one MIME type",
            ));
        }
        if self.file_field.trim().is_empty() {
            return Err(AppError::invalid_configuration("field must not be empty"));
        }
        if self.max_file_size > 2048 * 1024 * 1024 {
            log::warn!(
                "Large upload size limit configured: {}. Ensure adequate disk space.",
                crate::utils::format_bytes(self.max_file_size)
            );
        }
        Ok(())
    }

    /// `listen:port`
    pub fn bind_address(&self) -> String {
        if self.listen.contains(':') && !self.listen.starts_with('[') {
            format!("[{}]:{}", self.listen, self.port)
        } else {
            format!("{}:{}", self.listen, self.port)
        }
    }

    /// Log level implied by the logging flags
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.detailed_logging {
            "info"
        } else {
            "warn"
        }
    }

    /// Report where the settings came from. Called once logging is up.
    pub fn log_source(&self) {
        match self.config_file {
            Some(ref path) => log::info!("Loaded configuration from: {}", path.display()),
            None => log::info!("No configuration file found, using defaults and CLI overrides"),
        }
    }

    pub fn print_summary(&self) {
        log::info!("Configuration Summary:");
        log::info!("  Server: {}", self.bind_address());
        log::info!("  Threads: {}", self.threads);
        match self.read_timeout {
            Some(timeout) => log::info!("  Read Timeout: {}s", timeout.as_secs()),
            None => log::info!("  Read Timeout: disabled"),
        }
        log::info!("  Upload Directory: {}", self.upload_dir.display());
        log::info!(
            "  Max File Size: {}",
            crate::utils::format_bytes(self.max_file_size)
        );
        log::info!("  File Field: {}", self.file_field);
        log::info!("  Allowed Types: {:?}", self.allowed_mime_types);
        log::info!("  Chunk Size: {} bytes", self.chunk_size);
        log::info!("  CORS: {}", if self.cors { "Enabled" } else { "Disabled" });
        log::info!("  Verbose Logging: {}", self.verbose);
        log::info!("  Detailed Logging: {}", self.detailed_logging);
    }
}
