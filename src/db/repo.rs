use super::model::{reaction_from_row, ExternalIdRow, REACTION_COLUMNS};
use super::Pool;
use crate::model::{field, Fields, Kind, NewRecord, ReactionRecord, Service, Status};
use crate::store::{name_key, ContentStore, StatusChange, TimeWindow};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use std::collections::BTreeMap;
use tracing::instrument;
use uuid::Uuid;

/// Content store over the `reactions` tables.
#[derive(Debug, Clone)]
pub struct SqliteContentStore {
    pool: Pool,
}

impl SqliteContentStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn external_ids(&self, id: &str) -> Result<Vec<ExternalIdRow>> {
        let rows = sqlx::query_as::<_, ExternalIdRow>(
            "SELECT service, external_id, url FROM reaction_external_ids WHERE reaction_id = ?",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn hydrate(&self, row: SqliteRow) -> Result<ReactionRecord> {
        let id: String = row.get("id");
        let ids = self.external_ids(&id).await?;
        reaction_from_row(&row, ids)
    }

    /// Ids of `kind` records inside `window`, nearest in time first.
    async fn ids_in_window(&self, kind: Kind, window: TimeWindow) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM reactions WHERE kind = ? AND occurred_ts BETWEEN ? AND ? \
             ORDER BY abs(occurred_ts - ?) ASC, id ASC",
        )
        .bind(kind.as_str())
        .bind(window.start().timestamp())
        .bind(window.end().timestamp())
        .bind(window.at.timestamp())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn coordinates(fields: &Fields) -> (Option<f64>, Option<f64>) {
    let parse = |key: &str| fields.get(key).and_then(|v| v.trim().parse::<f64>().ok());
    (parse(field::LATITUDE), parse(field::LONGITUDE))
}

async fn insert_external_id_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    service: Service,
    external_id: &str,
    url: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO reaction_external_ids (reaction_id, service, external_id, url) \
         VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(id)
    .bind(service.as_str())
    .bind(external_id)
    .bind(url)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[async_trait]
impl ContentStore for SqliteContentStore {
    #[instrument(skip_all)]
    async fn get(&self, id: &str) -> Result<Option<ReactionRecord>> {
        let sql = format!("SELECT {} FROM reactions WHERE id = ?", REACTION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip_all, fields(kind = %record.kind))]
    async fn create(&self, record: NewRecord) -> Result<ReactionRecord> {
        let id = Uuid::new_v4().to_string();
        let created_at = record.occurred_at;
        let published_at = (record.status == Status::Published).then_some(record.occurred_at);
        let fields_json = serde_json::to_string(&record.fields)?;
        let (lat, lon) = coordinates(&record.fields);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO reactions (id, kind, fields, content_note, status, created_at, \
             published_at, occurred_ts, latitude, longitude, imported_from) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(record.kind.as_str())
        .bind(&fields_json)
        .bind(&record.content_note)
        .bind(record.status.as_str())
        .bind(created_at)
        .bind(published_at)
        .bind(record.occurred_at.timestamp())
        .bind(lat)
        .bind(lon)
        .bind(record.imported_from.map(|s| s.as_str()))
        .execute(&mut *tx)
        .await?;

        let mut external_ids = BTreeMap::new();
        let mut syndication_urls = BTreeMap::new();
        if let Some(ext) = &record.external_id {
            let inserted =
                insert_external_id_tx(&mut tx, &id, ext.service, &ext.id, ext.url.as_deref())
                    .await?;
            if !inserted {
                return Err(anyhow!(
                    "{} id {} already belongs to another record",
                    ext.service,
                    ext.id
                ));
            }
            external_ids.insert(ext.service, ext.id.clone());
            if let Some(url) = &ext.url {
                syndication_urls.insert(ext.service, url.clone());
            }
        }
        tx.commit().await?;

        Ok(ReactionRecord {
            id,
            kind: record.kind,
            fields: record.fields,
            content_note: record.content_note,
            status: record.status,
            created_at,
            published_at,
            imported_from: record.imported_from,
            external_ids,
            syndication_urls,
        })
    }

    #[instrument(skip_all)]
    async fn update_fields(&self, id: &str, partial: &Fields) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let current: Option<String> = sqlx::query_scalar("SELECT fields FROM reactions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(current) = current else {
            return Err(anyhow!("reaction {} not found", id));
        };
        let mut fields: Fields = serde_json::from_str(&current)
            .with_context(|| format!("reaction {} has invalid fields", id))?;
        for (key, value) in partial {
            if value.trim().is_empty() {
                fields.remove(key);
            } else {
                fields.insert(key.clone(), value.trim().to_string());
            }
        }
        let (lat, lon) = coordinates(&fields);
        sqlx::query("UPDATE reactions SET fields = ?, latitude = ?, longitude = ? WHERE id = ?")
            .bind(serde_json::to_string(&fields)?)
            .bind(lat)
            .bind(lon)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all, fields(status = status.as_str()))]
    async fn set_status(&self, id: &str, status: Status) -> Result<StatusChange> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status, created_at, published_at FROM reactions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(anyhow!("reaction {} not found", id));
        };
        let previous_str: String = row.get("status");
        let previous = Status::parse_status(&previous_str)
            .ok_or_else(|| anyhow!("reaction {} has unknown status {}", id, previous_str))?;
        let created_at: DateTime<Utc> = row.get("created_at");
        let mut published_at: Option<DateTime<Utc>> = row.get("published_at");
        if status == Status::Published && published_at.is_none() {
            published_at = Some(Utc::now());
        }
        let occurred = published_at.unwrap_or(created_at);
        sqlx::query(
            "UPDATE reactions SET status = ?, published_at = ?, occurred_ts = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(published_at)
        .bind(occurred.timestamp())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let record = self
            .get(id)
            .await?
            .ok_or_else(|| anyhow!("reaction {} vanished", id))?;
        Ok(StatusChange { previous, record })
    }

    #[instrument(skip_all, fields(service = %service))]
    async fn record_syndication(
        &self,
        id: &str,
        service: Service,
        external_id: &str,
        url: Option<&str>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_external_id_tx(&mut tx, id, service, external_id, url).await?;
        if inserted {
            sqlx::query("DELETE FROM sync_attempts WHERE reaction_id = ? AND service = ?")
                .bind(id)
                .bind(service.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    #[instrument(skip_all, fields(service = %service))]
    async fn find_by_external_id(
        &self,
        service: Service,
        external_id: &str,
    ) -> Result<Option<ReactionRecord>> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT reaction_id FROM reaction_external_ids WHERE service = ? AND external_id = ?",
        )
        .bind(service.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        match id {
            Some(id) => self.get(&id).await,
            None => Ok(None),
        }
    }

    #[instrument(skip_all, fields(kind = %kind))]
    async fn find_by_field_near(
        &self,
        kind: Kind,
        field: &str,
        value: &str,
        window: TimeWindow,
        unlinked_to: Option<Service>,
    ) -> Result<Option<ReactionRecord>> {
        let wanted = name_key(value);
        if wanted.is_empty() {
            return Ok(None);
        }
        for id in self.ids_in_window(kind, window).await? {
            let Some(candidate) = self.get(&id).await? else {
                continue;
            };
            if unlinked_to.is_some_and(|service| candidate.is_syndicated_to(service)) {
                continue;
            }
            if candidate.field(field).map(name_key).as_deref() == Some(wanted.as_str()) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    #[instrument(skip_all, fields(kind = %kind))]
    async fn find_near(
        &self,
        kind: Kind,
        lat: f64,
        lon: f64,
        radius_degrees: f64,
        window: TimeWindow,
    ) -> Result<Option<ReactionRecord>> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM reactions WHERE kind = ? \
             AND latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ? \
             AND occurred_ts BETWEEN ? AND ? \
             ORDER BY abs(occurred_ts - ?) ASC LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(lat - radius_degrees)
        .bind(lat + radius_degrees)
        .bind(lon - radius_degrees)
        .bind(lon + radius_degrees)
        .bind(window.start().timestamp())
        .bind(window.end().timestamp())
        .bind(window.at.timestamp())
        .fetch_optional(&self.pool)
        .await?;
        match id {
            Some(id) => self.get(&id).await,
            None => Ok(None),
        }
    }

    #[instrument(skip_all, fields(service = %service))]
    async fn record_failed_attempt(
        &self,
        id: &str,
        service: Service,
        error: &str,
    ) -> Result<u32> {
        let failures: i64 = sqlx::query_scalar(
            "INSERT INTO sync_attempts (reaction_id, service, failures, last_error) \
             VALUES (?, ?, 1, ?) \
             ON CONFLICT (reaction_id, service) DO UPDATE SET \
               failures = failures + 1, last_error = excluded.last_error, \
               last_attempt_at = CURRENT_TIMESTAMP \
             RETURNING failures",
        )
        .bind(id)
        .bind(service.as_str())
        .bind(error)
        .fetch_one(&self.pool)
        .await?;
        Ok(failures.max(0) as u32)
    }

    async fn failed_attempts(&self, id: &str, service: Service) -> Result<u32> {
        let failures: Option<i64> = sqlx::query_scalar(
            "SELECT failures FROM sync_attempts WHERE reaction_id = ? AND service = ?",
        )
        .bind(id)
        .bind(service.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(failures.unwrap_or(0).max(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::model::ExternalRef;
    use chrono::{Duration, TimeZone};

    async fn setup_store() -> SqliteContentStore {
        SqliteContentStore::new(db::memory_pool().await.unwrap())
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn checkin(venue: &str, when: DateTime<Utc>) -> NewRecord {
        NewRecord::new(Kind::Checkin, when)
            .with_field(field::VENUE_NAME, venue)
            .with_field(field::LATITUDE, "51.5007")
            .with_field(field::LONGITUDE, "-0.1246")
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let store = setup_store().await;
        let mut new = checkin("Big Ben", at(0));
        new.status = Status::Published;
        new.imported_from = Some(Service::Foursquare);
        new.external_id = Some(ExternalRef {
            service: Service::Foursquare,
            id: "4sq-1".into(),
            url: Some("https://www.swarmapp.com/checkin/4sq-1".into()),
        });
        let created = store.create(new).await.unwrap();

        let loaded = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.published_at, Some(at(0)));
        assert_eq!(loaded.imported_from, Some(Service::Foursquare));
        assert!(loaded.is_syndicated_to(Service::Foursquare));

        let by_ext = store
            .find_by_external_id(Service::Foursquare, "4sq-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_ext.id, created.id);
    }

    #[tokio::test]
    async fn duplicate_external_id_on_create_fails() {
        let store = setup_store().await;
        let ext = ExternalRef {
            service: Service::Lastfm,
            id: "same".into(),
            url: None,
        };
        let mut a = NewRecord::new(Kind::Listen, at(0));
        a.external_id = Some(ext.clone());
        store.create(a).await.unwrap();
        let mut b = NewRecord::new(Kind::Listen, at(1));
        b.external_id = Some(ext);
        assert!(store.create(b).await.is_err());
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reactions")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn status_transitions_report_previous() {
        let store = setup_store().await;
        let r = store.create(checkin("Cafe", at(0))).await.unwrap();

        let change = store.set_status(&r.id, Status::Published).await.unwrap();
        assert_eq!(change.previous, Status::Draft);
        assert!(change.entered_published());
        assert!(change.record.published_at.is_some());

        let again = store.set_status(&r.id, Status::Published).await.unwrap();
        assert!(!again.entered_published());
        assert_eq!(again.record.published_at, change.record.published_at);
    }

    #[tokio::test]
    async fn record_syndication_is_insert_once() {
        let store = setup_store().await;
        let r = store.create(checkin("Cafe", at(0))).await.unwrap();
        assert!(store
            .record_syndication(&r.id, Service::Foursquare, "c1", Some("https://x/c1"))
            .await
            .unwrap());
        assert!(!store
            .record_syndication(&r.id, Service::Foursquare, "c2", None)
            .await
            .unwrap());
        let loaded = store.get(&r.id).await.unwrap().unwrap();
        assert_eq!(loaded.external_ids[&Service::Foursquare], "c1");
        assert_eq!(loaded.syndication_urls[&Service::Foursquare], "https://x/c1");
    }

    #[tokio::test]
    async fn fuzzy_name_window_boundary() {
        let store = setup_store().await;
        store.create(checkin("Blue Bottle Coffee", at(10))).await.unwrap();
        let window = |m| TimeWindow::around(at(m), Duration::minutes(5));

        let hit = store
            .find_by_field_near(Kind::Checkin, field::VENUE_NAME, "blue bottle coffee", window(14), None)
            .await
            .unwrap();
        assert!(hit.is_some(), "4 minutes apart is a duplicate");

        let miss = store
            .find_by_field_near(Kind::Checkin, field::VENUE_NAME, "Blue Bottle Coffee", window(16), None)
            .await
            .unwrap();
        assert!(miss.is_none(), "6 minutes apart is not");

        let other = store
            .find_by_field_near(Kind::Checkin, field::VENUE_NAME, "Starbucks", window(10), None)
            .await
            .unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn fuzzy_match_skips_records_linked_elsewhere() {
        let store = setup_store().await;
        let linked = store.create(checkin("The Harp", at(0))).await.unwrap();
        store
            .record_syndication(&linked.id, Service::Untappd, "u-1", None)
            .await
            .unwrap();
        let window = TimeWindow::around(at(1), Duration::minutes(5));

        let hit = store
            .find_by_field_near(Kind::Checkin, field::VENUE_NAME, "The Harp", window, None)
            .await
            .unwrap();
        assert_eq!(hit.map(|r| r.id), Some(linked.id.clone()));

        let miss = store
            .find_by_field_near(
                Kind::Checkin,
                field::VENUE_NAME,
                "The Harp",
                window,
                Some(Service::Untappd),
            )
            .await
            .unwrap();
        assert!(miss.is_none(), "already an untappd checkin");

        let other_service = store
            .find_by_field_near(
                Kind::Checkin,
                field::VENUE_NAME,
                "The Harp",
                window,
                Some(Service::Foursquare),
            )
            .await
            .unwrap();
        assert_eq!(other_service.map(|r| r.id), Some(linked.id));
    }

    #[tokio::test]
    async fn find_near_uses_box_and_window() {
        let store = setup_store().await;
        store.create(checkin("Big Ben", at(0))).await.unwrap();
        let w = TimeWindow::around(at(2), Duration::minutes(5));

        assert!(store
            .find_near(Kind::Checkin, 51.5012, -0.1246, 0.001, w)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_near(Kind::Checkin, 51.5030, -0.1246, 0.001, w)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_near(Kind::Listen, 51.5007, -0.1246, 0.001, w)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn update_fields_merges_and_removes() {
        let store = setup_store().await;
        let r = store.create(checkin("Cafe", at(0))).await.unwrap();
        let mut partial = Fields::new();
        partial.insert(field::FOURSQUARE_VENUE_ID.into(), "v-1".into());
        partial.insert(field::LATITUDE.into(), "".into());
        store.update_fields(&r.id, &partial).await.unwrap();

        let loaded = store.get(&r.id).await.unwrap().unwrap();
        assert_eq!(loaded.field(field::FOURSQUARE_VENUE_ID), Some("v-1"));
        assert_eq!(loaded.field(field::VENUE_NAME), Some("Cafe"));
        assert_eq!(loaded.field(field::LATITUDE), None);
    }

    #[tokio::test]
    async fn failed_attempts_count_and_reset() {
        let store = setup_store().await;
        let r = store.create(checkin("Cafe", at(0))).await.unwrap();
        assert_eq!(store.failed_attempts(&r.id, Service::Foursquare).await.unwrap(), 0);
        store
            .record_failed_attempt(&r.id, Service::Foursquare, "timeout")
            .await
            .unwrap();
        let n = store
            .record_failed_attempt(&r.id, Service::Foursquare, "timeout")
            .await
            .unwrap();
        assert_eq!(n, 2);
        store
            .record_syndication(&r.id, Service::Foursquare, "c1", None)
            .await
            .unwrap();
        assert_eq!(store.failed_attempts(&r.id, Service::Foursquare).await.unwrap(), 0);
    }
}
