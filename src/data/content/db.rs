use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument};
use mongodb::{Collection, Database};
use rocket::http::Status;
use uuid::Uuid;

use crate::resp::problem::Problem;
use crate::util;

use super::{Comment, Content, Reply};

pub static CONTENT_COLLECTION_NAME: &str = "content";

pub mod problem {
    use crate::resp::problem::Problem;
    use rocket::http::Status;
    use uuid::Uuid;

    #[inline]
    pub fn not_found(id: Uuid) -> Problem {
        Problem::new_untyped(Status::NotFound, "Content not found.")
            .insert("id", id.to_string())
            .clone()
    }

    /// Ownership failures on publish and update look like missing content.
    #[inline]
    pub fn not_found_or_unauthorized(id: Uuid) -> Problem {
        Problem::new_untyped(Status::NotFound, "Content not found or unauthorized.")
            .insert("id", id.to_string())
            .clone()
    }

    #[inline]
    pub fn comment_not_found(id: Uuid) -> Problem {
        Problem::new_untyped(Status::NotFound, "Comment not found.")
            .insert("id", id.to_string())
            .clone()
    }

    #[inline]
    pub fn duplicate_title(existing: Uuid) -> Problem {
        Problem::new_untyped(Status::Conflict, "You already have content with this title.")
            .insert("existing_content_id", existing.to_string())
            .clone()
    }
}

fn content(db: &Database) -> Collection<Content> {
    db.collection(CONTENT_COLLECTION_NAME)
}

fn by_id(id: Uuid) -> Document {
    doc! { "_id": util::bson_uuid(id) }
}

fn owned(id: Uuid, teacher: Uuid) -> Document {
    doc! { "_id": util::bson_uuid(id), "teacher": util::bson_uuid(teacher) }
}

fn after_update() -> FindOneAndUpdateOptions {
    FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::After)
        .build()
}

#[rocket::async_trait]
pub trait ContentDbExt {
    async fn insert_content(&self, content: &Content) -> Result<(), Problem>;

    async fn get_content(&self, id: Uuid) -> Result<Option<Content>, Problem>;
    async fn find_owned_content(&self, id: Uuid, teacher: Uuid)
        -> Result<Option<Content>, Problem>;
    /// Case-insensitive exact title match among the teacher's content.
    async fn find_duplicate_title(
        &self,
        teacher: Uuid,
        title: &str,
        except: Option<Uuid>,
    ) -> Result<Option<Content>, Problem>;

    /// Publishes an unpublished item owned by `teacher`.
    async fn publish_content(&self, id: Uuid, teacher: Uuid) -> Result<Option<Content>, Problem>;
    /// Applies a full update document (`$set`/`$unset`) to an item owned by `teacher`.
    async fn update_content(
        &self,
        id: Uuid,
        teacher: Uuid,
        update: Document,
    ) -> Result<Option<Content>, Problem>;
    async fn delete_content(&self, id: Uuid) -> Result<Option<Content>, Problem>;

    async fn list_content(
        &self,
        filter: Document,
        sort: Document,
        skip: u64,
        limit: u32,
    ) -> Result<Vec<Content>, Problem>;
    async fn count_content(&self, filter: Document) -> Result<u64, Problem>;

    async fn push_comment(&self, id: Uuid, comment: &Comment) -> Result<(), Problem>;
    async fn push_reply(&self, id: Uuid, comment: Uuid, reply: &Reply) -> Result<(), Problem>;
}

#[rocket::async_trait]
impl ContentDbExt for Database {
    async fn insert_content(&self, item: &Content) -> Result<(), Problem> {
        content(self).insert_one(item, None).await?;
        tracing::info!("stored content {} for teacher {}", item.id, item.teacher);
        Ok(())
    }

    async fn get_content(&self, id: Uuid) -> Result<Option<Content>, Problem> {
        content(self)
            .find_one(by_id(id), None)
            .await
            .map_err(Problem::from)
    }

    async fn find_owned_content(
        &self,
        id: Uuid,
        teacher: Uuid,
    ) -> Result<Option<Content>, Problem> {
        content(self)
            .find_one(owned(id, teacher), None)
            .await
            .map_err(Problem::from)
    }

    async fn find_duplicate_title(
        &self,
        teacher: Uuid,
        title: &str,
        except: Option<Uuid>,
    ) -> Result<Option<Content>, Problem> {
        let mut filter = doc! {
            "teacher": util::bson_uuid(teacher),
            "title": bson::Regex {
                pattern: format!("^{}$", regex::escape(title.trim())),
                options: "i".to_string(),
            },
        };
        if let Some(except) = except {
            filter.insert("_id", doc! { "$ne": util::bson_uuid(except) });
        }

        content(self)
            .find_one(filter, None)
            .await
            .map_err(Problem::from)
    }

    async fn publish_content(&self, id: Uuid, teacher: Uuid) -> Result<Option<Content>, Problem> {
        let now = bson::DateTime::now();
        let mut filter = owned(id, teacher);
        filter.insert("is_published", false);

        content(self)
            .find_one_and_update(
                filter,
                doc! { "$set": { "is_published": true, "published_at": now, "updated_at": now } },
                after_update(),
            )
            .await
            .map_err(Problem::from)
    }

    async fn update_content(
        &self,
        id: Uuid,
        teacher: Uuid,
        mut update: Document,
    ) -> Result<Option<Content>, Problem> {
        let mut set = match update.remove("$set") {
            Some(bson::Bson::Document(set)) => set,
            _ => Document::new(),
        };
        set.insert("updated_at", bson::DateTime::now());
        update.insert("$set", set);

        content(self)
            .find_one_and_update(owned(id, teacher), update, after_update())
            .await
            .map_err(Problem::from)
    }

    async fn delete_content(&self, id: Uuid) -> Result<Option<Content>, Problem> {
        content(self)
            .find_one_and_delete(by_id(id), None)
            .await
            .map_err(Problem::from)
    }

    async fn list_content(
        &self,
        filter: Document,
        sort: Document,
        skip: u64,
        limit: u32,
    ) -> Result<Vec<Content>, Problem> {
        let options = FindOptions::builder()
            .sort(sort)
            .skip(skip)
            .limit(limit as i64)
            .build();

        let cursor = content(self).find(filter, options).await?;
        cursor.try_collect().await.map_err(Problem::from)
    }

    async fn count_content(&self, filter: Document) -> Result<u64, Problem> {
        content(self)
            .count_documents(filter, None)
            .await
            .map_err(Problem::from)
    }

    async fn push_comment(&self, id: Uuid, comment: &Comment) -> Result<(), Problem> {
        let result = content(self)
            .update_one(
                by_id(id),
                doc! {
                    "$push": { "comments": bson::to_bson(comment)? },
                    "$set": { "updated_at": bson::DateTime::now() },
                },
                None,
            )
            .await?;

        if result.matched_count == 0 {
            return Err(problem::not_found(id));
        }
        Ok(())
    }

    async fn push_reply(&self, id: Uuid, comment: Uuid, reply: &Reply) -> Result<(), Problem> {
        let result = content(self)
            .update_one(
                doc! { "_id": util::bson_uuid(id), "comments.id": util::bson_uuid(comment) },
                doc! {
                    "$push": { "comments.$.replies": bson::to_bson(reply)? },
                    "$set": { "updated_at": bson::DateTime::now() },
                },
                None,
            )
            .await?;

        if result.matched_count == 0 {
            return Err(Problem::new_untyped(
                Status::NotFound,
                "Content or comment not found.",
            ));
        }
        Ok(())
    }
}
