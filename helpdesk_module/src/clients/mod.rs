//! Local client (customer contact) store with tags, notes and merging.

mod merge;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::mail::normalize_email;

pub use self::merge::{MergeError, MergeRecord, MergeStrategy, MergeSummary, MERGEABLE_FIELDS};

#[derive(Debug, thiserror::Error)]
pub enum ClientStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("{field}: {message}")]
    Validation { field: &'static str, message: String },
    #[error("client {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientRecord {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub website: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub merged_into: Option<i64>,
}

impl ClientRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Non-empty value of one of `MERGEABLE_FIELDS`.
    pub fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "name" => Some(self.name.as_str()),
            "email" => self.email.as_deref(),
            "phone" => self.phone.as_deref(),
            "company" => self.company.as_deref(),
            "address" => self.address.as_deref(),
            "city" => self.city.as_deref(),
            "country" => self.country.as_deref(),
            "website" => self.website.as_deref(),
            _ => None,
        };
        value.filter(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewClientRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientNote {
    pub id: i64,
    pub client_id: i64,
    pub body: String,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ClientStore {
    path: PathBuf,
}

impl ClientStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ClientStoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, ClientStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(CLIENTS_SCHEMA)?;
        Ok(conn)
    }

    pub fn create_client(&self, new: &NewClientRecord) -> Result<ClientRecord, ClientStoreError> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(ClientStoreError::Validation {
                field: "name",
                message: "The name field is required.".to_string(),
            });
        }
        let email = match non_empty(&new.email) {
            Some(raw) => Some(normalize_email(&raw).ok_or_else(|| ClientStoreError::Validation {
                field: "email",
                message: "The email must be a valid email address.".to_string(),
            })?),
            None => None,
        };

        let conn = self.open()?;
        if let Some(email) = email.as_deref() {
            if find_active_id_by_email(&conn, email)?.is_some() {
                return Err(ClientStoreError::Validation {
                    field: "email",
                    message: "The email has already been taken.".to_string(),
                });
            }
        }
        let now = format_datetime(Utc::now());
        conn.execute(
            "INSERT INTO clients
                (name, email, phone, company, address, city, country, website, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                name,
                email,
                non_empty(&new.phone),
                non_empty(&new.company),
                non_empty(&new.address),
                non_empty(&new.city),
                non_empty(&new.country),
                non_empty(&new.website),
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        load_client(&conn, id)?.ok_or(ClientStoreError::NotFound(id))
    }

    /// Includes soft-deleted clients so merged records stay inspectable.
    pub fn get_client(&self, id: i64) -> Result<Option<ClientRecord>, ClientStoreError> {
        let conn = self.open()?;
        load_client(&conn, id)
    }

    pub fn find_by_email(&self, email: &str) -> Result<Option<ClientRecord>, ClientStoreError> {
        let Some(email) = normalize_email(email) else {
            return Ok(None);
        };
        let conn = self.open()?;
        match find_active_id_by_email(&conn, &email)? {
            Some(id) => load_client(&conn, id),
            None => Ok(None),
        }
    }

    pub fn add_tag(&self, client_id: i64, tag: &str) -> Result<Vec<String>, ClientStoreError> {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            return Err(ClientStoreError::Validation {
                field: "tag",
                message: "The tag field is required.".to_string(),
            });
        }
        let conn = self.open()?;
        require_active(&conn, client_id)?;
        conn.execute(
            "INSERT OR IGNORE INTO client_tags (client_id, tag) VALUES (?1, ?2)",
            params![client_id, tag],
        )?;
        load_tags(&conn, client_id)
    }

    pub fn add_note(
        &self,
        client_id: i64,
        body: &str,
        author: Option<&str>,
    ) -> Result<ClientNote, ClientStoreError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ClientStoreError::Validation {
                field: "body",
                message: "The body field is required.".to_string(),
            });
        }
        let conn = self.open()?;
        require_active(&conn, client_id)?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO client_notes (client_id, body, author, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![client_id, body, author, format_datetime(now)],
        )?;
        Ok(ClientNote {
            id: conn.last_insert_rowid(),
            client_id,
            body: body.to_string(),
            author: author.map(str::to_string),
            created_at: now,
        })
    }

    pub fn list_notes(&self, client_id: i64) -> Result<Vec<ClientNote>, ClientStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, client_id, body, author, created_at
             FROM client_notes
             WHERE client_id = ?1
             ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![client_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut notes = Vec::new();
        for row in rows {
            let (id, client_id, body, author, created_at) = row?;
            notes.push(ClientNote {
                id,
                client_id,
                body,
                author,
                created_at: parse_datetime(&created_at)?,
            });
        }
        Ok(notes)
    }
}

const CLIENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS clients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    company TEXT,
    address TEXT,
    city TEXT,
    country TEXT,
    website TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    merged_into INTEGER REFERENCES clients(id)
);
CREATE UNIQUE INDEX IF NOT EXISTS clients_active_email_idx
    ON clients(email) WHERE deleted_at IS NULL AND email IS NOT NULL;
CREATE TABLE IF NOT EXISTS client_tags (
    client_id INTEGER NOT NULL REFERENCES clients(id),
    tag TEXT NOT NULL,
    PRIMARY KEY (client_id, tag)
);
CREATE TABLE IF NOT EXISTS client_notes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id INTEGER NOT NULL REFERENCES clients(id),
    body TEXT NOT NULL,
    author TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS client_notes_client_idx ON client_notes(client_id);
CREATE TABLE IF NOT EXISTS client_merges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    primary_client_id INTEGER NOT NULL REFERENCES clients(id),
    merged_client_id INTEGER NOT NULL REFERENCES clients(id),
    strategy TEXT NOT NULL,
    field_sources_json TEXT NOT NULL,
    merged_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS client_merges_primary_idx ON client_merges(primary_client_id);
"#;

const CLIENT_COLUMNS: &str = "id, name, email, phone, company, address, city, country, website,
    created_at, updated_at, deleted_at, merged_into";

struct RawClient {
    id: i64,
    name: String,
    email: Option<String>,
    phone: Option<String>,
    company: Option<String>,
    address: Option<String>,
    city: Option<String>,
    country: Option<String>,
    website: Option<String>,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
    merged_into: Option<i64>,
}

fn read_client(row: &Row<'_>) -> rusqlite::Result<RawClient> {
    Ok(RawClient {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        company: row.get(4)?,
        address: row.get(5)?,
        city: row.get(6)?,
        country: row.get(7)?,
        website: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        deleted_at: row.get(11)?,
        merged_into: row.get(12)?,
    })
}

fn load_client(conn: &Connection, id: i64) -> Result<Option<ClientRecord>, ClientStoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM clients WHERE id = ?1", CLIENT_COLUMNS),
            params![id],
            read_client,
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    Ok(Some(ClientRecord {
        id: raw.id,
        name: raw.name,
        email: raw.email,
        phone: raw.phone,
        company: raw.company,
        address: raw.address,
        city: raw.city,
        country: raw.country,
        website: raw.website,
        tags: load_tags(conn, raw.id)?,
        created_at: parse_datetime(&raw.created_at)?,
        updated_at: parse_datetime(&raw.updated_at)?,
        deleted_at: raw.deleted_at.as_deref().map(parse_datetime).transpose()?,
        merged_into: raw.merged_into,
    }))
}

fn load_tags(conn: &Connection, client_id: i64) -> Result<Vec<String>, ClientStoreError> {
    let mut stmt = conn.prepare("SELECT tag FROM client_tags WHERE client_id = ?1 ORDER BY tag")?;
    let rows = stmt.query_map(params![client_id], |row| row.get::<_, String>(0))?;
    let mut tags = Vec::new();
    for row in rows {
        tags.push(row?);
    }
    Ok(tags)
}

fn find_active_id_by_email(conn: &Connection, email: &str) -> Result<Option<i64>, ClientStoreError> {
    Ok(conn
        .query_row(
            "SELECT id FROM clients WHERE email = ?1 AND deleted_at IS NULL",
            params![email],
            |row| row.get(0),
        )
        .optional()?)
}

fn require_active(conn: &Connection, client_id: i64) -> Result<(), ClientStoreError> {
    let deleted_at: Option<Option<String>> = conn
        .query_row(
            "SELECT deleted_at FROM clients WHERE id = ?1",
            params![client_id],
            |row| row.get(0),
        )
        .optional()?;
    match deleted_at {
        Some(None) => Ok(()),
        _ => Err(ClientStoreError::NotFound(client_id)),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests;
