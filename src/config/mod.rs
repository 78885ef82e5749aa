//! Configuration module for Converge projects.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `converge.yaml`
//! - Validation of settings, resources and policies
//! - Hashing attribute sets for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::AttributeHasher;
pub use parser::{
    find_project_file, ConfigParser, DEFAULT_PROJECT_FILES, ENV_CONCURRENCY, ENV_STATE_PATH,
};
pub use spec::{ProjectConfig, ResourceSpec, RetrySettings, Settings, StateSettings};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
