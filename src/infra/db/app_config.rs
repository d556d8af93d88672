use async_trait::async_trait;

use crate::cache::{ConfigLookup, ConfigStore, IdentityError};

use super::PostgresRepositories;

#[async_trait]
impl ConfigStore for PostgresRepositories {
    async fn fetch_value(&self, key: &str) -> ConfigLookup {
        let row = sqlx::query_scalar::<_, Option<String>>(
            r#"
            SELECT value
            FROM app_config
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await;

        match row {
            Ok(Some(Some(value))) => ConfigLookup::Found(value),
            Ok(Some(None)) | Ok(None) => ConfigLookup::NotFound,
            Err(err) => ConfigLookup::Unavailable(err.to_string()),
        }
    }

    async fn store_value(&self, key: &str, value: &str) -> Result<(), IdentityError> {
        sqlx::query(
            r#"
            INSERT INTO app_config (key, value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await
        .map(|_| ())
        .map_err(|err| IdentityError::Write(err.to_string()))
    }
}
