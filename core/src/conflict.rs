//! Per-entity conflict policy.
//!
//! Pure decision logic: given the client's and the server's copy of the same
//! record, pick the copy to keep and describe what happened. Nothing here
//! touches storage or fails.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{EntityType, SyncMeta, Versioned};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    ServerWins,
    LastWriteWins,
}

/// Recipes always keep the server copy; every other type is last-write-wins.
#[must_use]
pub fn policy_for(entity: EntityType) -> Policy {
    match entity {
        EntityType::Recipe => Policy::ServerWins,
        EntityType::PantryItem
        | EntityType::ShoppingList
        | EntityType::ShoppingItem
        | EntityType::MealPlan
        | EntityType::MealPlanEntry => Policy::LastWriteWins,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    ServerWins,
    ClientWins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    VersionMismatch,
    /// Exactly one side is deleted.
    TombstoneMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    ServerAuthoritative,
    ClientNewer,
    ServerNewer,
    SameTimestamp,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictReason::ServerAuthoritative => "server copy is authoritative for this type",
            ConflictReason::ClientNewer => "client edit is newer than the server copy",
            ConflictReason::ServerNewer => "server copy is newer than the client edit",
            ConflictReason::SameTimestamp => "timestamps tie, server copy kept",
        })
    }
}

/// Informational record of one resolved collision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub resource_type: EntityType,
    pub resource_id: String,
    pub resolution: Resolution,
    pub kind: ConflictKind,
    pub reason: ConflictReason,
    pub client_version: i64,
    pub server_version: i64,
}

#[derive(Debug, Clone)]
pub struct Resolved<'a, T> {
    pub winner: &'a T,
    pub resolution: Resolution,
    /// `None` when the copies did not actually disagree.
    pub conflict: Option<ConflictRecord>,
}

/// True when the copies disagree on version or on tombstone status.
#[must_use]
pub fn needs_resolution(client: &SyncMeta, server: &SyncMeta) -> bool {
    client.is_tombstone() != server.is_tombstone() || client.sync_version != server.sync_version
}

/// Decide between two disagreeing copies of one record.
///
/// Both-deleted copies with different versions are compared like live ones.
#[must_use]
pub fn decide(entity: EntityType, client: &SyncMeta, server: &SyncMeta) -> (Resolution, ConflictReason) {
    match policy_for(entity) {
        Policy::ServerWins => (Resolution::ServerWins, ConflictReason::ServerAuthoritative),
        Policy::LastWriteWins => match client.updated_at.cmp(&server.updated_at) {
            std::cmp::Ordering::Greater => (Resolution::ClientWins, ConflictReason::ClientNewer),
            std::cmp::Ordering::Less => (Resolution::ServerWins, ConflictReason::ServerNewer),
            std::cmp::Ordering::Equal => (Resolution::ServerWins, ConflictReason::SameTimestamp),
        },
    }
}

pub fn resolve<'a, T: Versioned>(client: &'a T, server: &'a T) -> Resolved<'a, T> {
    let (c, s) = (client.sync(), server.sync());
    if !needs_resolution(c, s) {
        return Resolved {
            winner: server,
            resolution: Resolution::ServerWins,
            conflict: None,
        };
    }

    let kind = if c.is_tombstone() == s.is_tombstone() {
        ConflictKind::VersionMismatch
    } else {
        ConflictKind::TombstoneMismatch
    };
    let (resolution, reason) = decide(T::ENTITY, c, s);
    let winner = match resolution {
        Resolution::ServerWins => server,
        Resolution::ClientWins => client,
    };

    Resolved {
        winner,
        resolution,
        conflict: Some(ConflictRecord {
            resource_type: T::ENTITY,
            resource_id: server.id().to_string(),
            resolution,
            kind,
            reason,
            client_version: c.sync_version,
            server_version: s.sync_version,
        }),
    }
}
