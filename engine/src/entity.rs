//! Entity types for cached shop records.

use crate::{error::Result, EntityId, Error, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of client-generated ids that have not been confirmed remotely.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Named attributes of an entity.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// The fixed set of domain record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Product,
    Customer,
    Sale,
    Transaction,
    DebtPayment,
}

impl EntityType {
    /// Every entity type, in cache load order.
    pub const ALL: [EntityType; 5] = [
        EntityType::Product,
        EntityType::Customer,
        EntityType::Sale,
        EntityType::Transaction,
        EntityType::DebtPayment,
    ];

    /// Remote table backing this entity type.
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Product => "products",
            EntityType::Customer => "customers",
            EntityType::Sale => "sales",
            EntityType::Transaction => "transactions",
            EntityType::DebtPayment => "debt_payments",
        }
    }

    /// Resolve a table name (or the camelCase type name) to an entity type.
    pub fn from_table(name: &str) -> Option<Self> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.table() == name || t.type_name() == name)
    }

    /// Durable storage key of this type's cached collection.
    pub fn cache_key(&self) -> String {
        format!("cache:{}", self.table())
    }

    /// Money-moving record types. Their mutations drain first and are
    /// re-derived rather than dropped on conflict.
    pub fn is_financial(&self) -> bool {
        matches!(self, EntityType::Transaction | EntityType::DebtPayment)
    }

    fn type_name(&self) -> &'static str {
        match self {
            EntityType::Product => "product",
            EntityType::Customer => "customer",
            EntityType::Sale => "sale",
            EntityType::Transaction => "transaction",
            EntityType::DebtPayment => "debtPayment",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EntityType::from_table(s).ok_or_else(|| Error::UnknownEntityType(s.to_string()))
    }
}

/// Synchronization state of a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    #[default]
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
}

/// Identity of an entity across all collections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, id: impl Into<EntityId>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// The last authoritative remote state of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmed {
    pub fields: Fields,
    pub updated_at: Timestamp,
}

/// A cached domain record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Stable identifier; `temp-` prefixed until the backend assigns one
    pub id: EntityId,
    pub entity_type: EntityType,
    /// Current (possibly optimistic) attributes
    pub fields: Fields,
    /// Last modification time (milliseconds since epoch)
    pub updated_at: Timestamp,
    pub sync_state: SyncState,
    /// Tombstone: hidden from reads until the delete is confirmed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Remote state this entity was last confirmed at, if ever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<Confirmed>,
}

impl Entity {
    /// Create a locally originated entity that has not been synced yet.
    pub fn new_local(
        entity_type: EntityType,
        id: impl Into<EntityId>,
        fields: Fields,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type,
            fields,
            updated_at: timestamp,
            sync_state: SyncState::PendingCreate,
            deleted: false,
            confirmed: None,
        }
    }

    /// Create an entity from an authoritative remote row.
    ///
    /// The row must carry an `id`; `updatedAt` falls back to `timestamp`.
    pub fn from_remote(entity_type: EntityType, row: Fields, timestamp: Timestamp) -> Result<Self> {
        let id = row_id(&row)
            .ok_or_else(|| Error::InvalidPayload(format!("{entity_type} row without id")))?;
        let updated_at = row_updated_at(&row).unwrap_or(timestamp);

        Ok(Self {
            id,
            entity_type,
            confirmed: Some(Confirmed {
                fields: row.clone(),
                updated_at,
            }),
            fields: row,
            updated_at,
            sync_state: SyncState::Synced,
            deleted: false,
        })
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.id.clone())
    }

    /// Check if entity is visible (not tombstoned).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Whether the id is still client-generated.
    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    pub fn is_synced(&self) -> bool {
        self.sync_state == SyncState::Synced
    }

    /// Read a numeric field, treating a missing or null field as zero.
    pub fn number(&self, field: &str) -> f64 {
        self.fields.get(field).and_then(|v| v.as_f64()).unwrap_or(0.0)
    }

    /// Accept a remote row as the new truth for this entity.
    pub fn confirm(&mut self, row: Fields, timestamp: Timestamp) {
        let updated_at = row_updated_at(&row).unwrap_or(timestamp);
        if let Some(id) = row_id(&row) {
            self.id = id;
        }
        self.fields = row.clone();
        self.updated_at = updated_at;
        self.sync_state = SyncState::Synced;
        self.deleted = false;
        self.confirmed = Some(Confirmed {
            fields: row,
            updated_at,
        });
    }

    /// Last confirmed remote modification time, if the entity was ever synced.
    pub fn confirmed_at(&self) -> Option<Timestamp> {
        self.confirmed.as_ref().map(|c| c.updated_at)
    }
}

/// Extract the `id` of a row, accepting string or numeric ids.
pub fn row_id(row: &Fields) -> Option<EntityId> {
    match row.get("id")? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract the `updatedAt` of a normalized row as milliseconds.
pub fn row_updated_at(row: &Fields) -> Option<Timestamp> {
    row.get("updatedAt").and_then(|v| v.as_u64())
}
