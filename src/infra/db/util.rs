use crate::cache::StoreError;

pub fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to statement timeout") =>
        {
            StoreError::Timeout
        }
        other => StoreError::backend(other.to_string()),
    }
}
