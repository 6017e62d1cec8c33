use std::time::Duration;

use bson::{doc, Document};
use mongodb::options::IndexOptions;
use mongodb::{Client, Database, IndexModel};

use crate::config::{Config, DatabaseRetry};
use crate::data::content::db::CONTENT_COLLECTION_NAME;
use crate::data::notification::db::NOTIFICATION_COLLECTION_NAME;
use crate::data::user::db::USER_COLLECTION_NAME;
use crate::error::BackendError;

const BACKOFF_FACTOR: f64 = 1.5;
const DUPLICATE_KEY: i32 = 11000;

/// Wait before retry number `attempt` (1-based).
pub fn retry_delay(retry: &DatabaseRetry, attempt: u32) -> Duration {
    let factor = BACKOFF_FACTOR.powi(attempt.saturating_sub(1) as i32);
    Duration::from_millis((retry.interval_ms as f64 * factor) as u64)
}

/// Connects and pings MongoDB, retrying with backoff before giving up.
pub async fn connect_with_retry(config: &Config) -> Result<Database, BackendError> {
    let retry = &config.database_retry;
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match try_connect(config).await {
            Ok(db) => {
                tracing::info!("Connected to MongoDB database: {}", config.mongodb_db);
                return Ok(db);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::error!("Giving up on MongoDB after {} attempts.", attempt);
                return Err(BackendError::DatabaseUnreachable {
                    attempts: attempt,
                    source: e,
                });
            }
            Err(e) => {
                let wait = retry_delay(retry, attempt);
                tracing::warn!(
                    "MongoDB connection attempt {}/{} failed: {}. Retrying in {:?}...",
                    attempt,
                    max_attempts,
                    e,
                    wait
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}

async fn try_connect(config: &Config) -> Result<Database, mongodb::error::Error> {
    let client = Client::with_uri_str(config.mongodb_uri.as_str()).await?;
    let db = client.database(config.mongodb_db.as_str());
    db.run_command(doc! { "ping": 1 }, None).await?;
    Ok(db)
}

/// Whether a write was refused by a unique index.
pub fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};

    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(it)) => it.code == DUPLICATE_KEY,
        ErrorKind::Command(it) => it.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn index(keys: Document) -> IndexModel {
    IndexModel::builder().keys(keys).build()
}

fn unique(keys: Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).build())
        .build()
}

pub async fn ensure_indexes(db: &Database) -> Result<(), mongodb::error::Error> {
    db.collection::<Document>(USER_COLLECTION_NAME)
        .create_indexes(
            vec![
                unique(doc! { "email": 1 }),
                index(doc! { "role": 1, "created_at": -1 }),
            ],
            None,
        )
        .await?;

    db.collection::<Document>(CONTENT_COLLECTION_NAME)
        .create_indexes(
            vec![
                index(doc! { "teacher": 1, "created_at": -1 }),
                index(doc! { "is_published": 1, "grade": 1, "subject": 1 }),
            ],
            None,
        )
        .await?;

    db.collection::<Document>(NOTIFICATION_COLLECTION_NAME)
        .create_indexes(
            vec![
                index(doc! { "recipient": 1, "created_at": -1 }),
                index(doc! { "rooms": 1, "created_at": -1 }),
            ],
            None,
        )
        .await?;

    tracing::info!("MongoDB indexes are in place.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_by_half() {
        let retry = DatabaseRetry {
            max_attempts: 5,
            interval_ms: 1000,
        };
        assert_eq!(retry_delay(&retry, 1), Duration::from_millis(1000));
        assert_eq!(retry_delay(&retry, 2), Duration::from_millis(1500));
        assert_eq!(retry_delay(&retry, 3), Duration::from_millis(2250));
    }

    #[tokio::test]
    async fn unreachable_database_gives_up() {
        let mut config = Config::for_tests();
        config.mongodb_uri =
            "mongodb://127.0.0.1:1/?serverSelectionTimeoutMS=100&connectTimeoutMS=100".to_string();
        config.database_retry = DatabaseRetry {
            max_attempts: 2,
            interval_ms: 10,
        };

        match connect_with_retry(&config).await {
            Err(BackendError::DatabaseUnreachable { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected unreachable database, got {:?}", other.map(|_| ())),
        }
    }
}
