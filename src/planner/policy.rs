//! Per-type replacement policy.
//!
//! Which attributes force a replacement is provider knowledge, so it is
//! supplied as configuration data instead of being hard-coded.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Key of the fallback policy in the `policies` map of a project file.
pub const DEFAULT_POLICY_KEY: &str = "default";

/// Replacement rules for one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourcePolicy {
    /// Attributes that cannot be changed in place.
    pub immutable: BTreeSet<String>,
    /// Replace instead of update when a dependency is replaced.
    pub replace_on_dependency_replacement: bool,
}

/// Replacement rules for every resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImmutabilityPolicy {
    default: ResourcePolicy,
    types: BTreeMap<String, ResourcePolicy>,
}

impl ResourcePolicy {
    /// Creates a policy with the given immutable attributes.
    #[must_use]
    pub fn immutable<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            immutable: attributes.into_iter().map(Into::into).collect(),
            replace_on_dependency_replacement: false,
        }
    }

    /// Sets whether a replaced dependency forces replacement.
    #[must_use]
    pub const fn with_replace_on_dependency_replacement(mut self, replace: bool) -> Self {
        self.replace_on_dependency_replacement = replace;
        self
    }
}

impl ImmutabilityPolicy {
    /// Creates an empty policy: every attribute is mutable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a policy from a project file's `policies` map.
    ///
    /// The entry named [`DEFAULT_POLICY_KEY`] applies to every type.
    #[must_use]
    pub fn from_map(mut policies: BTreeMap<String, ResourcePolicy>) -> Self {
        let default = policies.remove(DEFAULT_POLICY_KEY).unwrap_or_default();
        Self {
            default,
            types: policies,
        }
    }

    /// Sets the policy of one resource type.
    #[must_use]
    pub fn with_type(mut self, resource_type: impl Into<String>, policy: ResourcePolicy) -> Self {
        self.types.insert(resource_type.into(), policy);
        self
    }

    /// Sets the fallback policy.
    #[must_use]
    pub fn with_default(mut self, policy: ResourcePolicy) -> Self {
        self.default = policy;
        self
    }

    /// Returns true if changing `attribute` on `resource_type` forces a replacement.
    #[must_use]
    pub fn is_immutable(&self, resource_type: &str, attribute: &str) -> bool {
        self.default.immutable.contains(attribute)
            || self
                .types
                .get(resource_type)
                .is_some_and(|p| p.immutable.contains(attribute))
    }

    /// Returns true if `resource_type` must be replaced when a dependency is.
    #[must_use]
    pub fn replace_on_dependency_replacement(&self, resource_type: &str) -> bool {
        self.default.replace_on_dependency_replacement
            || self
                .types
                .get(resource_type)
                .is_some_and(|p| p.replace_on_dependency_replacement)
    }

    /// Returns the configured resource types.
    pub fn types(&self) -> impl Iterator<Item = (&str, &ResourcePolicy)> {
        self.types.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_and_default_sets_are_merged() {
        let policy = ImmutabilityPolicy::new()
            .with_default(ResourcePolicy::immutable(["location"]))
            .with_type("network", ResourcePolicy::immutable(["address_space"]));

        assert!(policy.is_immutable("network", "address_space"));
        assert!(policy.is_immutable("network", "location"));
        assert!(policy.is_immutable("subnet", "location"));
        assert!(!policy.is_immutable("subnet", "address_space"));
        assert!(!policy.is_immutable("network", "tags"));
    }

    #[test]
    fn test_from_map_extracts_default() {
        let yaml = r"
default:
  immutable: [location]
database:
  immutable: [engine]
  replace_on_dependency_replacement: true
";
        let map: BTreeMap<String, ResourcePolicy> = serde_yaml::from_str(yaml).expect("parse");
        let policy = ImmutabilityPolicy::from_map(map);

        assert!(policy.is_immutable("anything", "location"));
        assert!(policy.replace_on_dependency_replacement("database"));
        assert!(!policy.replace_on_dependency_replacement("subnet"));
        assert_eq!(policy.types().count(), 1);
    }
}
