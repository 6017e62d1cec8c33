use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::data::content::ContentType;
use crate::role::Role;
use crate::util;

pub mod db;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewContent,
    ContentPublished,
    ContentUpdated,
    NewComment,
    CommentReply,
}

/// What a notification says, before it's addressed and stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NotificationDraft {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    /// Direct recipient. Broadcast notifications have none.
    pub recipient: Option<Uuid>,
    pub recipient_type: Role,
    pub related_content: Option<Uuid>,
    pub content_type: Option<ContentType>,
    pub subject: Option<String>,
    pub teacher: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "_id", with = "bson::serde_helpers::uuid_1_as_binary")]
    pub id: Uuid,
    #[serde(default, with = "util::serde_uuid::option")]
    pub recipient: Option<Uuid>,
    pub recipient_type: Role,
    /// Audience rooms of broadcast notifications.
    #[serde(default)]
    pub rooms: Vec<String>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(default, with = "util::serde_uuid::option")]
    pub related_content: Option<Uuid>,
    #[serde(default)]
    pub content_type: Option<ContentType>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default, with = "util::serde_uuid::option")]
    pub teacher: Option<Uuid>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, with = "util::serde_uuid::vec")]
    pub read_by: Vec<Uuid>,
    pub created_at: bson::DateTime,
}

impl Notification {
    pub fn new(id: Uuid, draft: NotificationDraft, rooms: Vec<String>) -> Notification {
        Notification {
            id,
            // direct notifications aren't matched by room
            rooms: if draft.recipient.is_some() { vec![] } else { rooms },
            recipient: draft.recipient,
            recipient_type: draft.recipient_type,
            kind: draft.kind,
            title: draft.title,
            message: draft.message,
            related_content: draft.related_content,
            content_type: draft.content_type,
            subject: draft.subject,
            teacher: draft.teacher,
            is_read: false,
            read_by: vec![],
            created_at: bson::DateTime::now(),
        }
    }

    pub fn is_read_by(&self, reader: Uuid) -> bool {
        match self.recipient {
            Some(_) => self.is_read,
            None => self.read_by.contains(&reader),
        }
    }

    pub fn into_response(self, reader: Uuid) -> NotificationResponse {
        NotificationResponse {
            is_read: self.is_read_by(reader),
            id: self.id,
            kind: self.kind,
            title: self.title,
            message: self.message,
            related_content: self.related_content,
            content_type: self.content_type,
            subject: self.subject,
            teacher: self.teacher,
            created_at: self.created_at.to_chrono(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NotificationResponse {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub related_content: Option<Uuid>,
    pub content_type: Option<ContentType>,
    pub subject: Option<String>,
    pub teacher: Option<Uuid>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(recipient: Option<Uuid>) -> NotificationDraft {
        NotificationDraft {
            kind: NotificationKind::NewContent,
            title: "New Content Available".to_string(),
            message: "Fractions has been added by your teacher".to_string(),
            recipient,
            recipient_type: Role::Student,
            related_content: Some(Uuid::new_v4()),
            content_type: Some(ContentType::Pdf),
            subject: Some("math".to_string()),
            teacher: Some(Uuid::new_v4()),
        }
    }

    #[test]
    fn broadcast_read_state_is_per_reader() {
        let reader = Uuid::new_v4();
        let mut notification =
            Notification::new(Uuid::new_v4(), draft(None), vec!["grade-5".to_string()]);
        assert_eq!(notification.rooms, vec!["grade-5".to_string()]);
        assert!(!notification.is_read_by(reader));

        notification.read_by.push(reader);
        assert!(notification.is_read_by(reader));
        assert!(!notification.is_read_by(Uuid::new_v4()));
    }

    #[test]
    fn direct_notifications_drop_rooms() {
        let recipient = Uuid::new_v4();
        let notification = Notification::new(
            Uuid::new_v4(),
            draft(Some(recipient)),
            vec![format!("user-{}", recipient)],
        );
        assert!(notification.rooms.is_empty());
        assert_eq!(notification.recipient, Some(recipient));
    }

    #[test]
    fn kinds_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&NotificationKind::CommentReply).unwrap(),
            "\"comment_reply\""
        );
    }

    #[test]
    fn notification_round_trips_through_bson() {
        let notification = Notification::new(Uuid::new_v4(), draft(None), vec!["role-student".into()]);
        let doc = bson::to_document(&notification).unwrap();
        assert_eq!(doc.get("recipient"), Some(&bson::Bson::Null));
        assert_eq!(doc.get_str("kind").unwrap(), "new_content");

        let back: Notification = bson::from_document(doc).unwrap();
        assert_eq!(back.related_content, notification.related_content);
        assert!(back.recipient.is_none());
    }
}
