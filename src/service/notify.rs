use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use mongodb::Database;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_futures::Instrument;
use uuid::Uuid;

use crate::data::content::{Access, Comment, Content};
use crate::data::notification::db::NotificationDbExt;
use crate::data::notification::{Notification, NotificationDraft, NotificationKind};
use crate::resp::problem::Problem;
use crate::role::Role;

/// Name of the server-sent event carrying notifications.
pub const NOTIFICATION_EVENT: &str = "notification";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Grade(u8),
    Subject(String),
    User(Uuid),
    Role(Role),
}

impl Room {
    pub fn parse(value: &str) -> Option<Room> {
        let (kind, name) = value.split_once('-')?;
        match kind {
            "grade" => name
                .parse::<u8>()
                .ok()
                .filter(|it| (1..=12).contains(it))
                .map(Room::Grade),
            "subject" => {
                let subject = name.trim().to_lowercase();
                if subject.is_empty() {
                    None
                } else {
                    Some(Room::Subject(subject))
                }
            }
            "user" => Uuid::parse_str(name).ok().map(Room::User),
            "role" => Role::parse(name).map(Room::Role),
            _ => None,
        }
    }

    /// Rooms a user is always part of.
    pub fn standing(user: Uuid, role: Role, grade: Option<u8>) -> Vec<Room> {
        let mut rooms = vec![Room::User(user), Room::Role(role)];
        if role == Role::Student {
            if let Some(grade) = grade {
                rooms.push(Room::Grade(grade));
            }
        }
        rooms
    }

    pub fn names(rooms: &[Room]) -> Vec<String> {
        rooms.iter().map(Room::to_string).collect()
    }
}

impl Display for Room {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Room::Grade(grade) => write!(f, "grade-{}", grade),
            Room::Subject(subject) => write!(f, "subject-{}", subject),
            Room::User(id) => write!(f, "user-{}", id),
            Room::Role(role) => write!(f, "role-{}", role),
        }
    }
}

/// Rooms that hear about `content`: its grade and subject, the allow-list when access
/// is restricted, or every student when nothing else matched.
pub fn audience_rooms(content: &Content) -> Vec<Room> {
    let mut rooms = vec![];
    if content.grade > 0 {
        rooms.push(Room::Grade(content.grade));
    }
    if !content.subject.is_empty() {
        rooms.push(Room::Subject(content.subject.clone()));
    }
    if content.access == Access::Specific {
        rooms.extend(content.allowed_students.iter().copied().map(Room::User));
    }
    if rooms.is_empty() {
        rooms.push(Room::Role(Role::Student));
    }
    rooms
}

/// Payload of a live notification.
#[derive(Debug, Clone, Serialize)]
pub struct LiveNotification {
    pub id: Uuid,
    #[serde(flatten)]
    pub draft: NotificationDraft,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RoomEvent {
    room: String,
    event: Arc<LiveNotification>,
}

type Members = Arc<Mutex<HashMap<String, usize>>>;

fn members_of(members: &Members) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
    members.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process pub/sub keyed by room name.
#[derive(Clone)]
pub struct RoomHub {
    sender: broadcast::Sender<RoomEvent>,
    members: Members,
}

impl RoomHub {
    pub fn new(capacity: usize) -> RoomHub {
        let (sender, _) = broadcast::channel(capacity.max(1));
        RoomHub {
            sender,
            members: Arc::default(),
        }
    }

    /// Delivers `event` to every current subscriber of `room`. Returns how many there were.
    pub fn emit(&self, room: &Room, event: Arc<LiveNotification>) -> usize {
        let room = room.to_string();
        let receivers = members_of(&self.members).get(&room).copied().unwrap_or(0);
        if receivers == 0 {
            tracing::trace!("nobody in {}", room);
            return 0;
        }

        match self.sender.send(RoomEvent { room, event }) {
            Ok(_) => receivers,
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self, rooms: Vec<Room>) -> Subscription {
        let mut names: Vec<String> = Room::names(&rooms);
        names.sort();
        names.dedup();

        let receiver = self.sender.subscribe();
        {
            let mut members = members_of(&self.members);
            for name in &names {
                *members.entry(name.clone()).or_insert(0) += 1;
            }
        }

        Subscription {
            rooms: names,
            receiver,
            members: self.members.clone(),
        }
    }

    pub fn subscribers(&self, room: &Room) -> usize {
        members_of(&self.members)
            .get(&room.to_string())
            .copied()
            .unwrap_or(0)
    }
}

pub struct Subscription {
    rooms: Vec<String>,
    receiver: broadcast::Receiver<RoomEvent>,
    members: Members,
}

impl Subscription {
    pub fn rooms(&self) -> &[String] {
        &self.rooms
    }

    /// Next event addressed to one of the subscribed rooms. `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<Arc<LiveNotification>> {
        loop {
            match self.receiver.recv().await {
                Ok(RoomEvent { room, event }) => {
                    if self.rooms.contains(&room) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("subscriber lagged behind, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut members = members_of(&self.members);
        for name in &self.rooms {
            if let Some(count) = members.get_mut(name) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    members.remove(name);
                }
            }
        }
    }
}

#[rocket::async_trait]
pub trait NotificationStore: Send + Sync {
    async fn store(&self, notification: &Notification) -> Result<(), Problem>;
}

#[rocket::async_trait]
impl NotificationStore for Database {
    async fn store(&self, notification: &Notification) -> Result<(), Problem> {
        self.insert_notification(notification).await
    }
}

/// One fan-out unit.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub rooms: Vec<Room>,
    pub draft: NotificationDraft,
    pub persist: bool,
}

impl Delivery {
    pub fn new_content(content: &Content) -> Delivery {
        Delivery {
            rooms: audience_rooms(content),
            draft: NotificationDraft {
                kind: NotificationKind::NewContent,
                title: "New Content Available".to_string(),
                message: format!("{} has been added by your teacher", content.title),
                recipient: None,
                recipient_type: Role::Student,
                related_content: Some(content.id),
                content_type: Some(content.content_type),
                subject: Some(content.subject.clone()),
                teacher: Some(content.teacher),
            },
            persist: true,
        }
    }

    pub fn content_published(content: &Content) -> Delivery {
        Delivery {
            rooms: vec![Room::User(content.teacher)],
            draft: NotificationDraft {
                kind: NotificationKind::ContentPublished,
                title: "Content Published".to_string(),
                message: format!("\"{}\" is now live for students", content.title),
                recipient: Some(content.teacher),
                recipient_type: Role::Teacher,
                related_content: Some(content.id),
                content_type: Some(content.content_type),
                subject: Some(content.subject.clone()),
                teacher: Some(content.teacher),
            },
            persist: true,
        }
    }

    pub fn content_updated(content: &Content) -> Delivery {
        Delivery {
            rooms: audience_rooms(content),
            draft: NotificationDraft {
                kind: NotificationKind::ContentUpdated,
                title: "Content Updated".to_string(),
                message: format!("The content \"{}\" has been updated", content.title),
                recipient: None,
                recipient_type: Role::Student,
                related_content: Some(content.id),
                content_type: Some(content.content_type),
                subject: Some(content.subject.clone()),
                teacher: Some(content.teacher),
            },
            persist: false,
        }
    }

    pub fn new_comment(content: &Content, author: &str, text: &str) -> Delivery {
        Delivery {
            rooms: vec![Room::User(content.teacher)],
            draft: NotificationDraft {
                kind: NotificationKind::NewComment,
                title: "New Comment on Your Content".to_string(),
                message: format!("{} commented on your lesson: '{}'", author, text),
                recipient: Some(content.teacher),
                recipient_type: Role::Teacher,
                related_content: Some(content.id),
                content_type: Some(content.content_type),
                subject: Some(content.subject.clone()),
                teacher: Some(content.teacher),
            },
            persist: true,
        }
    }

    pub fn comment_reply(content: &Content, comment: &Comment, author: &str, text: &str) -> Delivery {
        Delivery {
            rooms: vec![Room::User(comment.user)],
            draft: NotificationDraft {
                kind: NotificationKind::CommentReply,
                title: "New Reply to Your Comment".to_string(),
                message: format!("{} replied to your comment: \"{}\"", author, text),
                recipient: Some(comment.user),
                recipient_type: comment.user_type,
                related_content: Some(content.id),
                content_type: Some(content.content_type),
                subject: Some(content.subject.clone()),
                teacher: Some(content.teacher),
            },
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub id: Uuid,
    /// Sum over rooms, so a client in two rooms counts twice.
    pub receivers: usize,
    pub persisted: bool,
}

#[derive(Clone)]
pub struct Notifier {
    hub: RoomHub,
    store: Arc<dyn NotificationStore>,
}

impl Notifier {
    pub fn new(hub: RoomHub, store: Arc<dyn NotificationStore>) -> Notifier {
        Notifier { hub, store }
    }

    pub fn hub(&self) -> &RoomHub {
        &self.hub
    }

    /// Emits to every room, then stores the record. Storage failures are only logged.
    pub async fn send(&self, delivery: Delivery) -> DeliveryReport {
        let id = Uuid::new_v4();
        let live = Arc::new(LiveNotification {
            id,
            draft: delivery.draft.clone(),
            timestamp: Utc::now(),
        });

        let receivers = delivery
            .rooms
            .iter()
            .map(|room| self.hub.emit(room, live.clone()))
            .sum();
        tracing::info!(
            kind = ?delivery.draft.kind,
            rooms = delivery.rooms.len(),
            receivers,
            "notification emitted"
        );

        let mut persisted = false;
        if delivery.persist {
            let record = Notification::new(id, delivery.draft, Room::names(&delivery.rooms));
            match self.store.store(&record).await {
                Ok(()) => persisted = true,
                Err(e) => tracing::error!("unable to store notification {}: {}", id, e),
            }
        }

        DeliveryReport {
            id,
            receivers,
            persisted,
        }
    }

    /// Runs [`Notifier::send`] in the background.
    pub fn spawn(&self, delivery: Delivery) -> tokio::task::JoinHandle<DeliveryReport> {
        let notifier = self.clone();
        let span = tracing::info_span!("fan_out", kind = ?delivery.draft.kind);
        tokio::spawn(async move { notifier.send(delivery).await }.instrument(span))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Keeps stored notifications in memory, or fails every write.
    #[derive(Default)]
    pub struct MemoryStore {
        pub stored: Mutex<Vec<Notification>>,
        pub failing: bool,
    }

    #[rocket::async_trait]
    impl NotificationStore for MemoryStore {
        async fn store(&self, notification: &Notification) -> Result<(), Problem> {
            if self.failing {
                return Err(Problem::internal("store unavailable", "test"));
            }
            self.stored.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;
    use crate::data::content::tests::lesson;
    use std::time::Duration;

    fn notifier(store: Arc<MemoryStore>) -> Notifier {
        Notifier::new(RoomHub::new(16), store)
    }

    #[test]
    fn room_names_round_trip() {
        let user = Uuid::new_v4();
        for room in [
            Room::Grade(7),
            Room::Subject("math".to_string()),
            Room::User(user),
            Room::Role(Role::Teacher),
        ] {
            assert_eq!(Room::parse(&room.to_string()), Some(room));
        }
    }

    #[test]
    fn malformed_rooms_are_rejected() {
        for name in ["grade-13", "grade-x", "subject-", "user-42", "role-king", "lobby", ""] {
            assert_eq!(Room::parse(name), None, "{}", name);
        }
    }

    #[test]
    fn standing_rooms_add_grade_for_students_only() {
        let id = Uuid::new_v4();
        assert_eq!(Room::standing(id, Role::Student, Some(5)).len(), 3);
        assert_eq!(Room::standing(id, Role::Teacher, Some(5)).len(), 2);
    }

    #[test]
    fn audience_covers_grade_subject_and_allow_list() {
        let mut content = lesson(Uuid::new_v4());
        let student = Uuid::new_v4();
        content.access = Access::Specific;
        content.allowed_students = vec![student];

        let rooms = audience_rooms(&content);
        assert_eq!(
            rooms,
            vec![
                Room::Grade(5),
                Room::Subject("math".to_string()),
                Room::User(student)
            ]
        );
    }

    #[test]
    fn allow_list_is_ignored_for_open_access() {
        let mut content = lesson(Uuid::new_v4());
        content.allowed_students = vec![Uuid::new_v4()];
        assert_eq!(audience_rooms(&content).len(), 2);
    }

    #[test]
    fn audience_falls_back_to_students() {
        let mut content = lesson(Uuid::new_v4());
        content.grade = 0;
        content.subject = String::new();
        assert_eq!(audience_rooms(&content), vec![Room::Role(Role::Student)]);
    }

    #[test]
    fn emit_without_subscribers_reaches_nobody() {
        let hub = RoomHub::new(4);
        let event = Arc::new(LiveNotification {
            id: Uuid::new_v4(),
            draft: Delivery::new_content(&lesson(Uuid::new_v4())).draft,
            timestamp: Utc::now(),
        });
        assert_eq!(hub.emit(&Room::Grade(5), event), 0);
    }

    #[tokio::test]
    async fn subscribers_only_see_their_rooms() {
        let hub = RoomHub::new(16);
        let mut fifth = hub.subscribe(vec![Room::Grade(5)]);
        let mut sixth = hub.subscribe(vec![Room::Grade(6)]);

        let notifier = Notifier::new(hub.clone(), Arc::new(MemoryStore::default()));
        let report = notifier
            .send(Delivery::new_content(&lesson(Uuid::new_v4())))
            .await;
        assert_eq!(report.receivers, 1);

        let event = fifth.next().await.expect("event for grade 5");
        assert_eq!(event.id, report.id);
        assert_eq!(event.draft.kind, NotificationKind::NewContent);

        let nothing = tokio::time::timeout(Duration::from_millis(50), sixth.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn overlapping_rooms_deliver_twice() {
        let hub = RoomHub::new(16);
        let mut both = hub.subscribe(vec![Room::Grade(5), Room::Subject("math".into())]);
        let notifier = Notifier::new(hub.clone(), Arc::new(MemoryStore::default()));

        let report = notifier
            .send(Delivery::new_content(&lesson(Uuid::new_v4())))
            .await;
        assert_eq!(report.receivers, 2);
        assert_eq!(both.next().await.map(|it| it.id), Some(report.id));
        assert_eq!(both.next().await.map(|it| it.id), Some(report.id));
    }

    #[tokio::test]
    async fn dropped_subscriptions_leave_rooms() {
        let hub = RoomHub::new(4);
        let subscription = hub.subscribe(vec![Room::Grade(3), Room::Grade(3)]);
        assert_eq!(subscription.rooms().len(), 1);
        assert_eq!(hub.subscribers(&Room::Grade(3)), 1);
        drop(subscription);
        assert_eq!(hub.subscribers(&Room::Grade(3)), 0);
    }

    #[tokio::test]
    async fn lagging_subscribers_keep_going() {
        let hub = RoomHub::new(1);
        let mut slow = hub.subscribe(vec![Room::Grade(5)]);
        let notifier = Notifier::new(hub.clone(), Arc::new(MemoryStore::default()));

        let content = lesson(Uuid::new_v4());
        notifier.send(Delivery::content_updated(&content)).await;
        let last = notifier.send(Delivery::content_updated(&content)).await;

        // only the newest event survives a capacity of one
        let event = slow.next().await.expect("event after lag");
        assert_eq!(event.id, last.id);
    }

    #[tokio::test]
    async fn persisted_record_shares_the_live_id() {
        let store = Arc::new(MemoryStore::default());
        let content = lesson(Uuid::new_v4());

        let report = notifier(store.clone())
            .send(Delivery::new_content(&content))
            .await;
        assert!(report.persisted);

        let stored = store.stored.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, report.id);
        assert_eq!(stored[0].rooms, vec!["grade-5", "subject-math"]);
        assert!(stored[0].recipient.is_none());
    }

    #[tokio::test]
    async fn updates_are_live_only() {
        let store = Arc::new(MemoryStore::default());
        let report = notifier(store.clone())
            .send(Delivery::content_updated(&lesson(Uuid::new_v4())))
            .await;
        assert!(!report.persisted);
        assert!(store.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failures_do_not_undo_the_emit() {
        let hub = RoomHub::new(4);
        let teacher = Uuid::new_v4();
        let mut inbox = hub.subscribe(vec![Room::User(teacher)]);
        let store = Arc::new(MemoryStore {
            failing: true,
            ..Default::default()
        });

        let content = lesson(teacher);
        let report = Notifier::new(hub.clone(), store)
            .send(Delivery::new_comment(&content, "Ann Lee", "Nice"))
            .await;

        assert!(!report.persisted);
        let event = inbox.next().await.expect("live comment");
        assert_eq!(event.draft.recipient, Some(teacher));
        assert_eq!(event.draft.message, "Ann Lee commented on your lesson: 'Nice'");
    }

    #[tokio::test]
    async fn replies_go_to_the_commenter() {
        let store = Arc::new(MemoryStore::default());
        let content = lesson(Uuid::new_v4());
        let comment = Comment::new(Uuid::new_v4(), Role::Student, "Sam Doe".into(), "Hi".into());

        let handle = notifier(store.clone()).spawn(Delivery::comment_reply(
            &content,
            &comment,
            "Ms Smith",
            "Hello",
        ));
        let report = handle.await.expect("fan-out task");

        assert!(report.persisted);
        let stored = store.stored.lock().unwrap();
        assert_eq!(stored[0].recipient, Some(comment.user));
        assert_eq!(stored[0].recipient_type, Role::Student);
        assert_eq!(stored[0].kind, NotificationKind::CommentReply);
        assert!(stored[0].rooms.is_empty());
    }

    #[test]
    fn live_payload_flattens_the_draft() {
        let live = LiveNotification {
            id: Uuid::new_v4(),
            draft: Delivery::content_published(&lesson(Uuid::new_v4())).draft,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&live).unwrap();
        assert_eq!(json["kind"], "content_published");
        assert_eq!(json["title"], "Content Published");
        assert!(json.get("timestamp").is_some());
        assert!(json.get("draft").is_none());
    }
}
