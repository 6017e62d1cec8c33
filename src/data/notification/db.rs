use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::options::FindOptions;
use mongodb::{Collection, Database};
use uuid::Uuid;

use crate::resp::problem::Problem;
use crate::util;

use super::Notification;

pub static NOTIFICATION_COLLECTION_NAME: &str = "notifications";

/// Notification listings aren't configurable.
pub const NOTIFICATION_PAGE_SIZE: u32 = 6;

pub mod problem {
    use crate::resp::problem::Problem;
    use rocket::http::Status;
    use uuid::Uuid;

    #[inline]
    pub fn not_found(id: Uuid) -> Problem {
        Problem::new_untyped(Status::NotFound, "Notification not found.")
            .insert("id", id.to_string())
            .clone()
    }
}

fn notifications(db: &Database) -> Collection<Notification> {
    db.collection(NOTIFICATION_COLLECTION_NAME)
}

/// Records addressed to `reader` directly or broadcast to one of `rooms`.
pub fn visible_to(reader: Uuid, rooms: &[String]) -> Document {
    doc! {
        "$or": [
            { "recipient": util::bson_uuid(reader) },
            { "recipient": Bson::Null, "rooms": { "$in": rooms.to_vec() } },
        ]
    }
}

#[rocket::async_trait]
pub trait NotificationDbExt {
    async fn insert_notification(&self, notification: &Notification) -> Result<(), Problem>;

    async fn list_notifications(
        &self,
        reader: Uuid,
        rooms: &[String],
        skip: u64,
    ) -> Result<Vec<Notification>, Problem>;
    async fn count_notifications(&self, reader: Uuid, rooms: &[String]) -> Result<u64, Problem>;

    /// Marks one visible notification as read by `reader`.
    async fn mark_read(
        &self,
        id: Uuid,
        reader: Uuid,
        rooms: &[String],
    ) -> Result<Option<Notification>, Problem>;
    /// Returns how many notifications changed.
    async fn mark_all_read(&self, reader: Uuid, rooms: &[String]) -> Result<u64, Problem>;
}

#[rocket::async_trait]
impl NotificationDbExt for Database {
    async fn insert_notification(&self, notification: &Notification) -> Result<(), Problem> {
        notifications(self).insert_one(notification, None).await?;
        tracing::debug!("stored notification {}", notification.id);
        Ok(())
    }

    async fn list_notifications(
        &self,
        reader: Uuid,
        rooms: &[String],
        skip: u64,
    ) -> Result<Vec<Notification>, Problem> {
        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .skip(skip)
            .limit(NOTIFICATION_PAGE_SIZE as i64)
            .build();

        let cursor = notifications(self)
            .find(visible_to(reader, rooms), options)
            .await?;
        cursor.try_collect().await.map_err(Problem::from)
    }

    async fn count_notifications(&self, reader: Uuid, rooms: &[String]) -> Result<u64, Problem> {
        notifications(self)
            .count_documents(visible_to(reader, rooms), None)
            .await
            .map_err(Problem::from)
    }

    async fn mark_read(
        &self,
        id: Uuid,
        reader: Uuid,
        rooms: &[String],
    ) -> Result<Option<Notification>, Problem> {
        let filter = doc! {
            "$and": [ { "_id": util::bson_uuid(id) }, visible_to(reader, rooms) ]
        };
        let mut notification = match notifications(self).find_one(filter, None).await? {
            Some(it) => it,
            None => return Ok(None),
        };

        let update = match notification.recipient {
            Some(_) => {
                notification.is_read = true;
                doc! { "$set": { "is_read": true } }
            }
            None => {
                if !notification.read_by.contains(&reader) {
                    notification.read_by.push(reader);
                }
                doc! { "$addToSet": { "read_by": util::bson_uuid(reader) } }
            }
        };

        notifications(self)
            .update_one(doc! { "_id": util::bson_uuid(id) }, update, None)
            .await?;
        Ok(Some(notification))
    }

    async fn mark_all_read(&self, reader: Uuid, rooms: &[String]) -> Result<u64, Problem> {
        let direct = notifications(self)
            .update_many(
                doc! { "recipient": util::bson_uuid(reader), "is_read": false },
                doc! { "$set": { "is_read": true } },
                None,
            )
            .await?;

        let broadcast = notifications(self)
            .update_many(
                doc! {
                    "recipient": Bson::Null,
                    "rooms": { "$in": rooms.to_vec() },
                    "read_by": { "$ne": util::bson_uuid(reader) },
                },
                doc! { "$addToSet": { "read_by": util::bson_uuid(reader) } },
                None,
            )
            .await?;

        Ok(direct.modified_count + broadcast.modified_count)
    }
}
