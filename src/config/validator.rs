//! Project validation.
//!
//! Field ranges are checked through the `validator` derive on
//! [`Settings`](super::spec::Settings); everything that spans several
//! fields or entries is checked here.

use std::collections::{BTreeSet, HashSet};
use tracing::debug;
use validator::{Validate, ValidationErrors};

use crate::error::{ConfigError, ConvergeError, Result};
use crate::graph::is_valid_segment;
use crate::planner::DEFAULT_POLICY_KEY;

use super::spec::{ProjectConfig, ResourceSpec};

/// Validator for project files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a project.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &ProjectConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!(
                "Project validation passed with {} warnings",
                result.warnings.len()
            );
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ConvergeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and collects all findings.
    #[must_use]
    pub fn check(&self, config: &ProjectConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_settings(config, &mut result);
        Self::validate_resources(&config.resources, &mut result);
        Self::validate_policies(config, &mut result);

        result
    }

    fn validate_settings(config: &ProjectConfig, result: &mut ValidationResult) {
        let settings = &config.settings;

        // Nested retry errors are not part of `field_errors`, so the
        // retry section is checked on its own.
        if let Err(errors) = settings.validate() {
            push_field_errors("settings", &errors, result);
        }
        if let Err(errors) = settings.retry.validate() {
            push_field_errors("settings.retry", &errors, result);
        }

        if settings.retry.base_delay_ms > settings.retry.max_delay_ms {
            result.errors.push(ValidationError {
                field: String::from("settings.retry.base_delay_ms"),
                message: format!(
                    "Base delay ({}ms) exceeds max delay ({}ms)",
                    settings.retry.base_delay_ms, settings.retry.max_delay_ms
                ),
            });
        }

        if settings.state.path.as_os_str().is_empty() {
            result.errors.push(ValidationError {
                field: String::from("settings.state.path"),
                message: String::from("State path cannot be empty"),
            });
        }
    }

    fn validate_resources(resources: &[ResourceSpec], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined: apply would destroy everything in state"));
        }

        let mut seen = HashSet::new();
        for (i, resource) in resources.iter().enumerate() {
            let field = format!("resources[{i}]");

            if !is_valid_segment(&resource.resource_type) {
                result.errors.push(ValidationError {
                    field: format!("{field}.type"),
                    message: format!(
                        "Resource type '{}' is invalid. Use only letters, digits, '_' and '-'.",
                        resource.resource_type
                    ),
                });
            }

            if !is_valid_segment(&resource.name) {
                result.errors.push(ValidationError {
                    field: format!("{field}.name"),
                    message: format!(
                        "Resource name '{}' is invalid. Use only letters, digits, '_' and '-'.",
                        resource.name
                    ),
                });
            }

            let address = format!("{}.{}", resource.resource_type, resource.name);
            if !seen.insert(address.clone()) {
                result.errors.push(ValidationError {
                    field,
                    message: format!("Duplicate resource address: {address}"),
                });
            }
        }
    }

    fn validate_policies(config: &ProjectConfig, result: &mut ValidationResult) {
        let types: BTreeSet<&str> = config
            .resources
            .iter()
            .map(|r| r.resource_type.as_str())
            .collect();

        for (resource_type, policy) in &config.policies {
            if resource_type != DEFAULT_POLICY_KEY && !types.contains(resource_type.as_str()) {
                result.warnings.push(format!(
                    "Policy for '{resource_type}' matches no defined resource"
                ));
            }
            if policy.immutable.iter().any(String::is_empty) {
                result.errors.push(ValidationError {
                    field: format!("policies.{resource_type}.immutable"),
                    message: String::from("Immutable attribute names cannot be empty"),
                });
            }
        }
    }
}

fn push_field_errors(prefix: &str, errors: &ValidationErrors, result: &mut ValidationResult) {
    for (field, field_errors) in errors.field_errors() {
        for error in field_errors {
            result.errors.push(ValidationError {
                field: format!("{prefix}.{field}"),
                message: error.message.as_ref().map_or_else(
                    || format!("Invalid value ({})", error.code),
                    ToString::to_string,
                ),
            });
        }
    }
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::graph::Attributes;
    use crate::planner::ResourcePolicy;

    fn resource(resource_type: &str, name: &str) -> ResourceSpec {
        ResourceSpec {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            attributes: Attributes::new(),
        }
    }

    #[test]
    fn test_valid_project() {
        let config = ProjectConfig {
            resources: vec![resource("network", "main"), resource("subnet", "app")],
            ..ProjectConfig::default()
        };
        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_duplicates_and_bad_names() {
        let config = ProjectConfig {
            resources: vec![
                resource("network", "main"),
                resource("network", "main"),
                resource("net work", "main"),
            ],
            ..ProjectConfig::default()
        };
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 2);
        assert!(result.errors.iter().any(|e| e.message.contains("Duplicate")));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_settings_ranges_and_delays() {
        let mut settings = Settings {
            concurrency: 1000,
            ..Settings::default()
        };
        settings.retry.base_delay_ms = 60_000;
        let config = ProjectConfig {
            settings,
            resources: vec![resource("network", "main")],
            ..ProjectConfig::default()
        };

        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"settings.concurrency"));
        assert!(fields.contains(&"settings.retry.base_delay_ms"));
    }

    #[test]
    fn test_unused_policy_warns() {
        let config = ProjectConfig {
            policies: [
                ("vm".to_string(), ResourcePolicy::immutable(["size"])),
                (DEFAULT_POLICY_KEY.to_string(), ResourcePolicy::default()),
            ]
            .into_iter()
            .collect(),
            resources: vec![resource("network", "main")],
            ..ProjectConfig::default()
        };
        let result = ConfigValidator::new().check(&config);
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
    }
}
