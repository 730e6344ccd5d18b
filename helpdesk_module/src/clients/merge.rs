use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{format_datetime, load_client, parse_datetime, ClientRecord, ClientStore, ClientStoreError};

/// Columns a merge may copy onto the primary record.
pub const MERGEABLE_FIELDS: [&str; 8] = [
    "name", "email", "phone", "company", "address", "city", "country", "website",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Only fill fields the primary leaves empty.
    #[default]
    KeepPrimary,
    /// Value from the most recently updated record.
    PreferNewest,
    /// Longest value.
    PreferComplete,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStrategy::KeepPrimary => "keep_primary",
            MergeStrategy::PreferNewest => "prefer_newest",
            MergeStrategy::PreferComplete => "prefer_complete",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "keep_primary" => Ok(MergeStrategy::KeepPrimary),
            "prefer_newest" => Ok(MergeStrategy::PreferNewest),
            "prefer_complete" => Ok(MergeStrategy::PreferComplete),
            other => Err(format!("unknown merge strategy: {}", other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("at least one client id is required")]
    Empty,
    #[error("client {0} is the primary and cannot be merged into itself")]
    PrimaryInList(i64),
    #[error("client {0} is listed more than once")]
    DuplicateId(i64),
    #[error("client {0} does not exist")]
    UnknownClient(i64),
    #[error("client {0} is already deleted")]
    AlreadyDeleted(i64),
}

impl MergeError {
    /// Request field the error is reported against.
    pub fn field(&self) -> &'static str {
        match self {
            MergeError::PrimaryInList(_) => "primary_client_id",
            _ => "client_ids",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub primary: ClientRecord,
    pub merged_ids: Vec<i64>,
    pub strategy: MergeStrategy,
    /// Field name to the client id whose value the primary now carries.
    pub field_sources: BTreeMap<String, i64>,
    pub tags_added: usize,
    pub notes_moved: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeRecord {
    pub id: i64,
    pub primary_client_id: i64,
    pub merged_client_id: i64,
    pub strategy: MergeStrategy,
    /// Fields copied from `merged_client_id` onto the primary.
    pub fields_taken: Vec<String>,
    pub merged_at: DateTime<Utc>,
}

/// Chooses a value per field; returns only the fields whose winner is not the
/// primary, mapped to `(source id, value)`.
pub(super) fn resolve_fields(
    primary: &ClientRecord,
    others: &[ClientRecord],
    strategy: MergeStrategy,
) -> BTreeMap<&'static str, (i64, String)> {
    let mut changes = BTreeMap::new();
    for field in MERGEABLE_FIELDS {
        let winner = match strategy {
            MergeStrategy::KeepPrimary => {
                if primary.field(field).is_some() {
                    None
                } else {
                    others.iter().find(|other| other.field(field).is_some())
                }
            }
            MergeStrategy::PreferNewest => {
                let mut best = primary;
                for other in others {
                    if other.field(field).is_none() {
                        continue;
                    }
                    if best.field(field).is_none() || other.updated_at > best.updated_at {
                        best = other;
                    }
                }
                (best.id != primary.id).then_some(best)
            }
            MergeStrategy::PreferComplete => {
                let length = |record: &ClientRecord| {
                    record.field(field).map(|value| value.trim().chars().count()).unwrap_or(0)
                };
                let mut best = primary;
                for other in others {
                    if length(other) > length(best) {
                        best = other;
                    }
                }
                (best.id != primary.id).then_some(best)
            }
        };
        if let Some(source) = winner {
            if let Some(value) = source.field(field) {
                changes.insert(field, (source.id, value.trim().to_string()));
            }
        }
    }
    changes
}

fn validate_ids(primary_id: i64, client_ids: &[i64]) -> Result<(), MergeError> {
    if client_ids.is_empty() {
        return Err(MergeError::Empty);
    }
    let mut seen = HashSet::new();
    for id in client_ids {
        if *id == primary_id {
            return Err(MergeError::PrimaryInList(*id));
        }
        if !seen.insert(*id) {
            return Err(MergeError::DuplicateId(*id));
        }
    }
    Ok(())
}

impl ClientStore {
    /// Folds `client_ids` into `primary_id` in a single transaction: fields
    /// per `strategy`, tags unioned, notes re-pointed, merged records
    /// soft-deleted and one history row per merged record.
    pub fn merge_clients(
        &self,
        primary_id: i64,
        client_ids: &[i64],
        strategy: MergeStrategy,
    ) -> Result<MergeSummary, ClientStoreError> {
        validate_ids(primary_id, client_ids)?;

        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let primary = load_client(&tx, primary_id)?.ok_or(MergeError::UnknownClient(primary_id))?;
        if primary.is_deleted() {
            return Err(MergeError::AlreadyDeleted(primary_id).into());
        }
        let mut others = Vec::with_capacity(client_ids.len());
        for id in client_ids {
            let record = load_client(&tx, *id)?.ok_or(MergeError::UnknownClient(*id))?;
            if record.is_deleted() {
                return Err(MergeError::AlreadyDeleted(*id).into());
            }
            others.push(record);
        }

        let changes = resolve_fields(&primary, &others, strategy);
        let now = format_datetime(Utc::now());

        // Merged rows go first so the primary can take over their email.
        for other in &others {
            tx.execute(
                "UPDATE clients SET deleted_at = ?2, merged_into = ?3, updated_at = ?2 WHERE id = ?1",
                params![other.id, now, primary_id],
            )?;
        }

        let mut tags_added = 0;
        let mut notes_moved = 0;
        for other in &others {
            tags_added += tx.execute(
                "INSERT OR IGNORE INTO client_tags (client_id, tag)
                 SELECT ?1, tag FROM client_tags WHERE client_id = ?2",
                params![primary_id, other.id],
            )?;
            notes_moved += tx.execute(
                "UPDATE client_notes SET client_id = ?1 WHERE client_id = ?2",
                params![primary_id, other.id],
            )?;
        }

        for (field, (_, value)) in &changes {
            // `field` comes from MERGEABLE_FIELDS, never from input.
            tx.execute(
                &format!("UPDATE clients SET {} = ?2 WHERE id = ?1", field),
                params![primary_id, value],
            )?;
        }
        tx.execute(
            "UPDATE clients SET updated_at = ?2 WHERE id = ?1",
            params![primary_id, now],
        )?;

        for other in &others {
            let taken: Vec<&str> = changes
                .iter()
                .filter(|(_, (source, _))| *source == other.id)
                .map(|(field, _)| *field)
                .collect();
            tx.execute(
                "INSERT INTO client_merges
                    (primary_client_id, merged_client_id, strategy, field_sources_json, merged_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    primary_id,
                    other.id,
                    strategy.as_str(),
                    serde_json::to_string(&taken)?,
                    now
                ],
            )?;
        }

        let merged = load_client(&tx, primary_id)?.ok_or(ClientStoreError::NotFound(primary_id))?;
        tx.commit()?;

        info!(
            "merged clients {:?} into {} strategy={} fields={}",
            client_ids,
            primary_id,
            strategy,
            changes.len()
        );
        Ok(MergeSummary {
            primary: merged,
            merged_ids: client_ids.to_vec(),
            strategy,
            field_sources: changes
                .iter()
                .map(|(field, (source, _))| (field.to_string(), *source))
                .collect(),
            tags_added,
            notes_moved,
        })
    }

    pub fn merge_history(&self, primary_id: i64) -> Result<Vec<MergeRecord>, ClientStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, primary_client_id, merged_client_id, strategy, field_sources_json, merged_at
             FROM client_merges
             WHERE primary_client_id = ?1
             ORDER BY merged_at, id",
        )?;
        let rows = stmt.query_map(params![primary_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut history = Vec::new();
        for row in rows {
            let (id, primary_client_id, merged_client_id, strategy, fields, merged_at) = row?;
            history.push(MergeRecord {
                id,
                primary_client_id,
                merged_client_id,
                strategy: strategy.parse().unwrap_or_default(),
                fields_taken: serde_json::from_str(&fields)?,
                merged_at: parse_datetime(&merged_at)?,
            });
        }
        Ok(history)
    }
}
