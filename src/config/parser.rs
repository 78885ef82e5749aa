//! Project file parser.
//!
//! This module loads `converge.yaml`, applies `CONVERGE_*` environment
//! overrides and loads the `.env` file that sits next to the project file.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ConfigError, ConvergeError, Result};

use super::spec::ProjectConfig;

/// Overrides `settings.concurrency`.
pub const ENV_CONCURRENCY: &str = "CONVERGE_CONCURRENCY";

/// Overrides `settings.state.path`.
pub const ENV_STATE_PATH: &str = "CONVERGE_STATE_PATH";

/// Project file names searched for, in order.
pub const DEFAULT_PROJECT_FILES: &[&str] = &["converge.yaml", "converge.yml"];

/// Parser for project files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a project file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ProjectConfig> {
        let path = path.as_ref();
        info!("Loading project from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a project from a YAML string.
    ///
    /// A relative state path is resolved against the base path.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ProjectConfig> {
        debug!("Parsing YAML project");

        let mut config: ProjectConfig = serde_yaml::from_str(content).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source
                    .map(|p| p.display().to_string())
                    .or_else(|| e.location().map(|l| format!("line {}", l.line()))),
            })
        })?;

        self.resolve_state_path(&mut config);
        debug!("Parsed {} resource definitions", config.resources.len());
        Ok(config)
    }

    /// Loads a project file with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// override is malformed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<ProjectConfig> {
        let mut config = self.load_file(path)?;
        self.apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `CONVERGE_*` overrides read through `var`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnvVar`] if a numeric override does not parse.
    pub fn apply_env_overrides<F>(&self, config: &mut ProjectConfig, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = var(ENV_CONCURRENCY) {
            debug!("Overriding settings.concurrency from environment");
            config.settings.concurrency = value.trim().parse().map_err(|_| {
                ConvergeError::Config(ConfigError::MissingEnvVar {
                    name: ENV_CONCURRENCY.to_string(),
                })
            })?;
        }

        if let Some(path) = var(ENV_STATE_PATH) {
            debug!("Overriding settings.state.path from environment");
            config.settings.state.path = PathBuf::from(path);
            self.resolve_state_path(config);
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    fn resolve_state_path(&self, config: &mut ProjectConfig) {
        if let Some(base) = &self.base_path
            && config.settings.state.path.is_relative()
        {
            config.settings.state.path = base.join(&config.settings.state.path);
        }
    }
}

/// Finds the project file in `start_dir` or one of its parents.
///
/// # Errors
///
/// Returns an error if no project file is found.
pub fn find_project_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_PROJECT_FILES {
            let candidate = current.join(filename);
            if candidate.exists() {
                info!("Found project file: {}", candidate.display());
                return Ok(candidate);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_PROJECT_FILES[0]),
    }))
}
