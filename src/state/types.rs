//! State types for tracking applied resources.
//!
//! A [`StateRecord`] is the last-applied snapshot of one resource. The
//! [`StateFile`] is the on-disk document holding every record of a project.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::config::AttributeHasher;
use crate::graph::{Address, Attributes};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Trust level of a recorded resource.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Record matches what the provider last confirmed.
    #[default]
    Clean,
    /// A create or destroy may have been interrupted; the resource must be replaced.
    Tainted,
    /// An update may have been interrupted; the resource must be re-applied.
    Unknown,
}

/// Last-applied snapshot of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Resolved attributes sent to the provider.
    pub attributes: Attributes,
    /// Outputs returned by the provider.
    #[serde(default)]
    pub outputs: Attributes,
    /// Direct dependencies at the time of apply.
    #[serde(default)]
    pub dependencies: Vec<Address>,
    /// Fingerprint of `attributes`.
    pub attributes_hash: String,
    /// Trust level of this record.
    #[serde(default)]
    pub status: ResourceStatus,
    /// When the record was written.
    pub updated_at: DateTime<Utc>,
}

/// The complete state document of a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// State format version.
    pub version: String,
    /// Incremented on every persisted change.
    pub serial: u64,
    /// Identifier shared by every serial of the same state.
    pub lineage: Uuid,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Records keyed by address.
    #[serde(default)]
    pub resources: BTreeMap<Address, StateRecord>,
}

impl StateRecord {
    /// Creates a record with the given status.
    #[must_use]
    pub fn with_status(
        attributes: Attributes,
        outputs: Attributes,
        dependencies: Vec<Address>,
        status: ResourceStatus,
    ) -> Self {
        let attributes_hash = AttributeHasher::hash_attributes(&attributes);
        Self {
            attributes,
            outputs,
            dependencies,
            attributes_hash,
            status,
            updated_at: Utc::now(),
        }
    }

    /// Creates a record confirmed by the provider.
    #[must_use]
    pub fn clean(attributes: Attributes, outputs: Attributes, dependencies: Vec<Address>) -> Self {
        Self::with_status(attributes, outputs, dependencies, ResourceStatus::Clean)
    }

    /// Creates a record whose remote existence is uncertain.
    #[must_use]
    pub fn tainted(attributes: Attributes, dependencies: Vec<Address>) -> Self {
        Self::with_status(attributes, Attributes::new(), dependencies, ResourceStatus::Tainted)
    }

    /// Returns a copy of this record with another status.
    #[must_use]
    pub fn marked(&self, status: ResourceStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Returns every known value: attributes overlaid with outputs.
    #[must_use]
    pub fn known_values(&self) -> Attributes {
        let mut values = self.attributes.clone();
        values.extend(self.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        values
    }

    /// Returns true if the record can be trusted as-is.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        matches!(self.status, ResourceStatus::Clean)
    }
}

impl StateFile {
    /// Creates an empty state with a fresh lineage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            serial: 0,
            lineage: Uuid::new_v4(),
            last_updated: Utc::now(),
            resources: BTreeMap::new(),
        }
    }

    /// Gets a record by address.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<&StateRecord> {
        self.resources.get(address)
    }

    /// Adds or replaces a record.
    pub fn set(&mut self, address: Address, record: StateRecord) {
        self.resources.insert(address, record);
        self.touch();
    }

    /// Removes a record.
    pub fn remove(&mut self, address: &Address) -> Option<StateRecord> {
        let removed = self.resources.remove(address);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Counts records per status.
    #[must_use]
    pub fn status_counts(&self) -> BTreeMap<ResourceStatus, usize> {
        let mut counts = BTreeMap::new();
        for record in self.resources.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            Self::Clean => "clean",
            Self::Tainted => "tainted",
            Self::Unknown => "unknown",
        };
        write!(f, "{status}")
    }
}
