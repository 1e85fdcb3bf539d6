use super::Pool;
use crate::model::{Credential, CredentialPatch, Service};
use crate::store::CredentialStore;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::Row;
use tracing::instrument;

/// Credential store keeping one row per (service, key).
#[derive(Debug, Clone)]
pub struct SqliteCredentialStore {
    pool: Pool,
}

impl SqliteCredentialStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    #[instrument(skip_all, fields(service = %service))]
    async fn get(&self, service: Service) -> Result<Credential> {
        let rows = sqlx::query("SELECT key, value FROM credentials WHERE service = ?")
            .bind(service.as_str())
            .fetch_all(&self.pool)
            .await?;
        let values = rows
            .into_iter()
            .map(|row| (row.get::<String, _>("key"), row.get::<String, _>("value")))
            .collect();
        Ok(Credential { values })
    }

    /// Applies the whole patch in one transaction so a service's row set never
    /// holds half of a token rotation.
    #[instrument(skip_all, fields(service = %service))]
    async fn set(&self, service: Service, patch: CredentialPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (key, value) in &patch.values {
            match value {
                Some(value) => {
                    sqlx::query(
                        "INSERT INTO credentials (service, key, value) VALUES (?, ?, ?) \
                         ON CONFLICT (service, key) DO UPDATE SET \
                           value = excluded.value, updated_at = CURRENT_TIMESTAMP",
                    )
                    .bind(service.as_str())
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM credentials WHERE service = ? AND key = ?")
                        .bind(service.as_str())
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::model::cred;

    #[tokio::test]
    async fn set_get_and_delete() {
        let store = SqliteCredentialStore::new(db::memory_pool().await.unwrap());
        store
            .set(
                Service::Trakt,
                CredentialPatch::default()
                    .set(cred::CLIENT_ID, "cid")
                    .set(cred::ACCESS_TOKEN, "tok"),
            )
            .await
            .unwrap();
        store
            .set(
                Service::Trakt,
                CredentialPatch::default()
                    .set(cred::ACCESS_TOKEN, "tok2")
                    .remove(cred::CLIENT_ID),
            )
            .await
            .unwrap();
        let c = store.get(Service::Trakt).await.unwrap();
        assert_eq!(c.access_token(), Some("tok2"));
        assert_eq!(c.get(cred::CLIENT_ID), None);
    }

    #[tokio::test]
    async fn clear_tokens_only_touches_one_service() {
        let store = SqliteCredentialStore::new(db::memory_pool().await.unwrap());
        for svc in [Service::Foursquare, Service::Untappd] {
            store
                .set(
                    svc,
                    CredentialPatch::default()
                        .set(cred::CLIENT_ID, "id")
                        .set(cred::CLIENT_SECRET, "secret")
                        .set(cred::ACCESS_TOKEN, "at")
                        .set(cred::REFRESH_TOKEN, "rt"),
                )
                .await
                .unwrap();
        }

        store.clear_tokens(Service::Foursquare).await.unwrap();

        let fsq = store.get(Service::Foursquare).await.unwrap();
        assert_eq!(fsq.access_token(), None);
        assert_eq!(fsq.get(cred::REFRESH_TOKEN), None);
        assert_eq!(fsq.get(cred::CLIENT_ID), Some("id"));
        assert_eq!(fsq.get(cred::CLIENT_SECRET), Some("secret"));

        let untappd = store.get(Service::Untappd).await.unwrap();
        assert_eq!(untappd.access_token(), Some("at"));
        assert_eq!(untappd.get(cred::REFRESH_TOKEN), Some("rt"));
    }
}
