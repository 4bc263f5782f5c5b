//! References into the external product/location catalog.
//!
//! Products, bins, shelves, aisles and zones are owned by the back-office
//! catalog; this module only carries the denormalized descriptors inventory
//! lines (and audit snapshots) need.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stocktake_core::{DomainError, ValueObject};

/// Zone label used when a location chain is incomplete.
pub const UNASSIGNED_ZONE: &str = "Unassigned";

/// Identifier of a product in the external catalog.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(Uuid);

impl ProductId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProductId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ProductId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| DomainError::invalid_id(format!("ProductId: {e}")))?;
        Ok(Self(uuid))
    }
}

/// Denormalized product descriptor captured on an inventory line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRef {
    pub product_id: ProductId,
    pub sku: String,
    pub name: String,
}

impl ValueObject for ProductRef {}

/// Physical location chain of a stock line: bin → shelf → aisle → zone.
///
/// Only the bin is mandatory; warehouses that haven't mapped their layout
/// leave the rest of the chain empty, in which case the line groups under
/// [`UNASSIGNED_ZONE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub bin: String,
    pub shelf: Option<String>,
    pub aisle: Option<String>,
    pub zone: Option<String>,
}

impl StorageLocation {
    pub fn bin_only(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            shelf: None,
            aisle: None,
            zone: None,
        }
    }

    /// Zone label for grouping/assignment; incomplete chains are "Unassigned".
    pub fn zone_label(&self) -> &str {
        self.zone.as_deref().unwrap_or(UNASSIGNED_ZONE)
    }
}

impl ValueObject for StorageLocation {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_zone_groups_under_unassigned() {
        let loc = StorageLocation::bin_only("B-014");
        assert_eq!(loc.zone_label(), UNASSIGNED_ZONE);
    }

    #[test]
    fn zone_label_uses_the_mapped_zone() {
        let loc = StorageLocation {
            bin: "B-014".to_string(),
            shelf: Some("S2".to_string()),
            aisle: Some("A7".to_string()),
            zone: Some("Cold Storage".to_string()),
        };
        assert_eq!(loc.zone_label(), "Cold Storage");
    }
}
