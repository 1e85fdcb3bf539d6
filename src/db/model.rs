//! Row decoding for the reaction tables.
//!
//! Keep these focused on turning rows into domain values; query logic lives in
//! `repo`.

use crate::model::{Fields, Kind, ReactionRecord, Service, Status};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;

pub(crate) const REACTION_COLUMNS: &str =
    "id, kind, fields, content_note, status, created_at, published_at, imported_from";

/// One `reaction_external_ids` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExternalIdRow {
    pub service: String,
    pub external_id: String,
    pub url: Option<String>,
}

pub(crate) fn reaction_from_row(row: &SqliteRow, ids: Vec<ExternalIdRow>) -> Result<ReactionRecord> {
    let id: String = row.get("id");
    let kind_str: String = row.get("kind");
    let kind = Kind::parse_kind(&kind_str)
        .ok_or_else(|| anyhow!("reaction {} has unknown kind {}", id, kind_str))?;
    let status_str: String = row.get("status");
    let status = Status::parse_status(&status_str)
        .ok_or_else(|| anyhow!("reaction {} has unknown status {}", id, status_str))?;
    let fields_json: String = row.get("fields");
    let fields: Fields = serde_json::from_str(&fields_json)
        .map_err(|err| anyhow!("reaction {} has invalid fields: {}", id, err))?;
    let created_at: DateTime<Utc> = row.get("created_at");
    let published_at: Option<DateTime<Utc>> = row.get("published_at");
    let imported_from = row
        .get::<Option<String>, _>("imported_from")
        .and_then(|s| Service::parse_service(&s));

    let mut external_ids = BTreeMap::new();
    let mut syndication_urls = BTreeMap::new();
    for ext in ids {
        let Some(service) = Service::parse_service(&ext.service) else {
            continue;
        };
        external_ids.insert(service, ext.external_id);
        if let Some(url) = ext.url.filter(|u| !u.is_empty()) {
            syndication_urls.insert(service, url);
        }
    }

    Ok(ReactionRecord {
        id,
        kind,
        fields,
        content_note: row.get("content_note"),
        status,
        created_at,
        published_at,
        imported_from,
        external_ids,
        syndication_urls,
    })
}
