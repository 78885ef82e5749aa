//! Resource addresses and references.
//!
//! An [`Address`] is the unique `type.name` identifier of a resource
//! definition. A [`Reference`] points at one output attribute of an address
//! and is written `type.name.attribute`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::iter;

use crate::error::GraphError;

/// Unique `(type, name)` identifier of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    resource_type: String,
    name: String,
}

/// A pointer to one attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Reference {
    /// Address of the referenced resource.
    pub address: Address,
    /// Output attribute read from the referenced resource.
    pub attribute: String,
}

impl Address {
    /// Creates an address without validating its segments.
    ///
    /// Use [`Address::try_new`] for untrusted input.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Creates an address, validating both segments.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidAddress`] if a segment is empty or
    /// contains characters outside `[A-Za-z0-9_-]`.
    pub fn try_new(resource_type: &str, name: &str) -> Result<Self, GraphError> {
        for (segment, label) in [(resource_type, "type"), (name, "name")] {
            if !is_valid_segment(segment) {
                return Err(GraphError::InvalidAddress {
                    value: format!("{resource_type}.{name}"),
                    reason: format!("{label} must be non-empty and use only [A-Za-z0-9_-]"),
                });
            }
        }
        Ok(Self::new(resource_type, name))
    }

    /// Parses a `type.name` string.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidAddress`] if the text is not a valid address.
    pub fn parse(value: &str) -> Result<Self, GraphError> {
        let Some((resource_type, name)) = value.split_once('.') else {
            return Err(GraphError::InvalidAddress {
                value: value.to_string(),
                reason: String::from("expected 'type.name'"),
            });
        };
        Self::try_new(resource_type, name)
    }

    /// Returns the resource type.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Returns the resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a reference to one attribute of this address.
    #[must_use]
    pub fn attr(&self, attribute: impl Into<String>) -> Reference {
        Reference {
            address: self.clone(),
            attribute: attribute.into(),
        }
    }

    fn sort_key(&self) -> impl Iterator<Item = u8> + '_ {
        self.resource_type
            .bytes()
            .chain(iter::once(b'.'))
            .chain(self.name.bytes())
    }
}

// Ordered by the textual `type.name` form so ties in the resolver
// break the same way the addresses sort when printed.
impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(other.sort_key())
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Reference {
    /// Parses a `type.name.attribute` string.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidAddress`] if the text is not a valid reference.
    pub fn parse(value: &str) -> Result<Self, GraphError> {
        let mut parts = value.splitn(3, '.');
        let (Some(resource_type), Some(name), Some(attribute)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(GraphError::InvalidAddress {
                value: value.to_string(),
                reason: String::from("expected 'type.name.attribute'"),
            });
        };

        if attribute.is_empty() {
            return Err(GraphError::InvalidAddress {
                value: value.to_string(),
                reason: String::from("attribute must not be empty"),
            });
        }

        Ok(Self {
            address: Address::try_new(resource_type, name)?,
            attribute: attribute.to_string(),
        })
    }
}

/// Returns true if `segment` is a valid address segment.
#[must_use]
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.address, self.attribute)
    }
}

impl TryFrom<String> for Address {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for Reference {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> Self {
        reference.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let address = Address::parse("azurerm_subnet.app").expect("valid address");
        assert_eq!(address.resource_type(), "azurerm_subnet");
        assert_eq!(address.name(), "app");
        assert_eq!(address.to_string(), "azurerm_subnet.app");
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(Address::parse("no-dot").is_err());
        assert!(Address::parse(".name").is_err());
        assert!(Address::parse("type.").is_err());
        assert!(Address::parse("type.na me").is_err());
        assert!(Address::parse("type.name.extra").is_err());
    }

    #[test]
    fn test_parse_reference_keeps_dotted_attribute() {
        let reference = Reference::parse("network.main.tags.env").expect("valid reference");
        assert_eq!(reference.address, Address::new("network", "main"));
        assert_eq!(reference.attribute, "tags.env");
        assert!(Reference::parse("network.main").is_err());
        assert!(Reference::parse("network.main.").is_err());
    }

    #[test]
    fn test_ordering_follows_text_form() {
        // '-' sorts before '.', so "a-b.x" < "a.x" as strings.
        let dashed = Address::new("a-b", "x");
        let plain = Address::new("a", "x");
        assert!(dashed < plain);
        assert!(dashed.to_string() < plain.to_string());
    }

    #[test]
    fn test_serde_as_string() {
        let address = Address::new("key_vault", "main");
        let json = serde_json::to_string(&address).expect("serialize");
        assert_eq!(json, "\"key_vault.main\"");
        let back: Address = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, address);
    }
}
