// ABOUTME: Entity metadata for the managed feed resources
// ABOUTME: Names the feed resource, target table, key and timestamp fields

use serde::{Deserialize, Serialize};

/// Foreign-key relationship from a child entity to its parent table.
#[derive(Debug, Clone, Copy)]
pub struct ParentLink {
    /// Field on the child record holding the parent key.
    pub field: &'static str,
    /// Target table the parent lives in.
    pub table: &'static str,
    /// Column on the parent table holding the key.
    pub key_column: &'static str,
}

/// The feed resources this replicator manages.
///
/// `all()` returns them parent-first: a child run must only start after its
/// parent's batches are durably persisted, because the referential filter
/// consults live persistence state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Property,
    Media,
}

impl EntityType {
    pub fn all() -> [EntityType; 2] {
        [EntityType::Property, EntityType::Media]
    }

    /// Resource name on the feed side.
    pub fn resource(&self) -> &'static str {
        match self {
            EntityType::Property => "Property",
            EntityType::Media => "Media",
        }
    }

    /// Target table name.
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Property => "property",
            EntityType::Media => "media",
        }
    }

    /// Primary key field, identical on the feed and in the target table.
    pub fn key_field(&self) -> &'static str {
        match self {
            EntityType::Property => "ListingKey",
            EntityType::Media => "MediaKey",
        }
    }

    /// Modification timestamp field used for cursor ordering.
    pub fn timestamp_field(&self) -> &'static str {
        "ModificationTimestamp"
    }

    /// Parent link for child entities, `None` for roots.
    pub fn parent(&self) -> Option<ParentLink> {
        match self {
            EntityType::Property => None,
            EntityType::Media => Some(ParentLink {
                field: "ResourceRecordKey",
                table: "property",
                key_column: "ListingKey",
            }),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.resource())
    }
}

impl std::str::FromStr for EntityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "property" | "properties" => Ok(EntityType::Property),
            "media" => Ok(EntityType::Media),
            other => anyhow::bail!("unknown entity type '{}'", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_ordering() {
        let order = EntityType::all();
        assert_eq!(order[0], EntityType::Property);
        assert!(order[0].parent().is_none());
        assert_eq!(order[1].parent().unwrap().table, "property");
    }

    #[test]
    fn test_from_str() {
        assert_eq!("media".parse::<EntityType>().unwrap(), EntityType::Media);
        assert_eq!(
            "Property".parse::<EntityType>().unwrap(),
            EntityType::Property
        );
        assert!("listing".parse::<EntityType>().is_err());
    }
}
