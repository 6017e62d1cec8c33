use chrono::{DateTime, Utc};
use rocket::fs::TempFile;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::Config;
use crate::data::validate;
use crate::resp::problem::{problems, Problem};
use crate::role::Role;
use crate::service::media::StoredFile;
use crate::util;

pub mod db;
pub mod query;

pub const TITLE_MIN: usize = 3;
pub const TITLE_MAX: usize = 100;
pub const DESCRIPTION_MAX: usize = 500;
pub const COMMENT_MAX: usize = 1000;

#[derive(
    Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize, FromFormField, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Lecture,
    Assignment,
    Quiz,
    Resource,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, FromFormField, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Video,
    Image,
    Pdf,
    Document,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Video => "video",
            ContentType::Image => "image",
            ContentType::Pdf => "pdf",
            ContentType::Document => "document",
        }
    }

    pub fn needs_file(self) -> bool {
        self != ContentType::Text
    }
}

impl From<ContentType> for bson::Bson {
    fn from(value: ContentType) -> Self {
        bson::Bson::String(value.as_str().to_string())
    }
}

#[derive(
    Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize, FromFormField, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    All,
    Specific,
}

impl Access {
    pub fn as_str(self) -> &'static str {
        match self {
            Access::All => "all",
            Access::Specific => "specific",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CommentSettings {
    pub allow_comments: bool,
    pub only_teacher_can_comment: bool,
}

impl Default for CommentSettings {
    fn default() -> Self {
        CommentSettings {
            allow_comments: true,
            only_teacher_can_comment: false,
        }
    }
}

impl CommentSettings {
    pub fn check(&self, role: Role) -> Result<(), Problem> {
        if !self.allow_comments {
            return Err(problems::forbidden("Comments are disabled for this content."));
        }
        if self.only_teacher_can_comment && role != Role::Teacher {
            return Err(problems::forbidden(
                "Only teachers can comment on this content.",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    #[serde(with = "bson::serde_helpers::uuid_1_as_binary")]
    pub id: Uuid,
    #[serde(with = "bson::serde_helpers::uuid_1_as_binary")]
    pub user: Uuid,
    pub user_type: Role,
    pub author_name: String,
    pub text: String,
    pub created_at: bson::DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    #[serde(with = "bson::serde_helpers::uuid_1_as_binary")]
    pub id: Uuid,
    #[serde(with = "bson::serde_helpers::uuid_1_as_binary")]
    pub user: Uuid,
    pub user_type: Role,
    pub author_name: String,
    pub text: String,
    #[serde(default)]
    pub replies: Vec<Reply>,
    pub created_at: bson::DateTime,
}

/// Trimmed comment or reply text, 1 to 1000 characters.
pub fn comment_text(text: &str) -> Result<String, Problem> {
    validate::text("text", text, 1, COMMENT_MAX)
}

impl Comment {
    pub fn new(user: Uuid, user_type: Role, author_name: String, text: String) -> Comment {
        Comment {
            id: Uuid::new_v4(),
            user,
            user_type,
            author_name,
            text,
            replies: vec![],
            created_at: bson::DateTime::now(),
        }
    }
}

impl Reply {
    pub fn new(user: Uuid, user_type: Role, author_name: String, text: String) -> Reply {
        Reply {
            id: Uuid::new_v4(),
            user,
            user_type,
            author_name,
            text,
            created_at: bson::DateTime::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(rename = "_id", with = "bson::serde_helpers::uuid_1_as_binary")]
    pub id: Uuid,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub kind: ContentKind,
    pub subject: String,
    pub grade: u8,
    pub content_type: ContentType,
    #[serde(default)]
    pub file: Option<StoredFile>,
    #[serde(with = "bson::serde_helpers::uuid_1_as_binary")]
    pub teacher: Uuid,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub access: Access,
    #[serde(default, with = "util::serde_uuid::vec")]
    pub allowed_students: Vec<Uuid>,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default)]
    pub published_at: Option<bson::DateTime>,
    #[serde(default)]
    pub expires_at: Option<bson::DateTime>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub comment_settings: CommentSettings,
    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

impl Content {
    /// Published and not past its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_published
            && self
                .expires_at
                .map(|expires| expires.to_chrono() > now)
                .unwrap_or(true)
    }

    pub fn is_visible_to(&self, student: Uuid, now: DateTime<Utc>) -> bool {
        self.is_live(now)
            && match self.access {
                Access::All => true,
                Access::Specific => self.allowed_students.contains(&student),
            }
    }

    pub fn comment(&self, id: Uuid) -> Option<&Comment> {
        self.comments.iter().find(|it| it.id == id)
    }
}

/// Validated fields of a new content item, before a file is attached.
#[derive(Debug, Clone)]
pub struct NewContent {
    pub title: String,
    pub description: String,
    pub kind: ContentKind,
    pub subject: String,
    pub grade: u8,
    pub content_type: ContentType,
    pub tags: Vec<String>,
    pub message: String,
    pub access: Access,
    pub allowed_students: Vec<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub comment_settings: CommentSettings,
}

impl NewContent {
    pub fn into_content(self, teacher: Uuid, file: Option<StoredFile>) -> Content {
        let now = bson::DateTime::now();
        Content {
            id: Uuid::new_v4(),
            title: self.title,
            description: self.description,
            kind: self.kind,
            subject: self.subject,
            grade: self.grade,
            content_type: self.content_type,
            file,
            teacher,
            tags: self.tags,
            message: self.message,
            access: self.access,
            allowed_students: self.allowed_students,
            is_published: false,
            published_at: None,
            expires_at: self.expires_at.map(bson::DateTime::from_chrono),
            comments: vec![],
            comment_settings: self.comment_settings,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Multipart body shared by content creation and update.
///
/// Every field is optional so that missing values surface as validation problems
/// naming the field. Creation requires the fields an update may leave out.
#[derive(Debug, FromForm)]
pub struct ContentForm<'r> {
    pub title: Option<String>,
    pub description: Option<String>,
    pub kind: Option<ContentKind>,
    pub subject: Option<String>,
    pub grade: Option<u8>,
    pub content_type: Option<ContentType>,
    pub tags: Vec<String>,
    pub message: Option<String>,
    pub access: Option<Access>,
    pub allowed_students: Vec<Uuid>,
    /// RFC 3339 timestamp.
    pub expires_at: Option<String>,
    pub allow_comments: Option<bool>,
    pub only_teacher_can_comment: Option<bool>,
    pub file: Option<TempFile<'r>>,
}

fn subject(value: &str, config: &Config) -> Result<String, Problem> {
    let subject = value.trim().to_lowercase();
    if !config.allows_subject(&subject) {
        return Err(problems::invalid_field(
            "subject",
            format!(
                "Invalid subject. Allowed values: {}",
                config.allowed_subjects.join(", ")
            ),
        )
        .insert("allowed_subjects", &config.allowed_subjects)
        .to_owned());
    }
    Ok(subject)
}

fn expiry(value: &str) -> Result<DateTime<Utc>, Problem> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|it| it.with_timezone(&Utc))
        .map_err(|_| {
            problems::invalid_field("expires_at", "Expiry must be an RFC 3339 timestamp.")
        })
}

fn clean_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|it| it.trim().to_string())
        .filter(|it| !it.is_empty())
        .collect()
}

impl ContentForm<'_> {
    pub fn has_file(&self) -> bool {
        self.file.as_ref().map(|it| it.len() > 0).unwrap_or(false)
    }

    pub fn validate_new(&self, config: &Config) -> Result<NewContent, Problem> {
        let title = validate::required("title", self.title.as_deref())?;
        let description = validate::required("description", self.description.as_deref())?;
        let subject_name = validate::required("subject", self.subject.as_deref())?;
        let grade = validate::required_value("grade", self.grade)?;
        let content_type = validate::required_value("content_type", self.content_type)?;

        let new = NewContent {
            title: validate::text("title", title, TITLE_MIN, TITLE_MAX)?,
            description: validate::text("description", description, 0, DESCRIPTION_MAX)?,
            kind: self.kind.unwrap_or_default(),
            subject: subject(subject_name, config)?,
            grade: validate::grade(grade)?,
            content_type,
            tags: clean_tags(&self.tags),
            message: self.message.as_deref().unwrap_or_default().trim().to_string(),
            access: self.access.unwrap_or_default(),
            allowed_students: self.allowed_students.clone(),
            expires_at: self.expires_at.as_deref().map(expiry).transpose()?,
            comment_settings: CommentSettings {
                allow_comments: self.allow_comments.unwrap_or(true),
                only_teacher_can_comment: self.only_teacher_can_comment.unwrap_or(false),
            },
        };

        if new.content_type.needs_file() && !self.has_file() {
            return Err(problems::invalid_field(
                "file",
                format!(
                    "File is required for content type: {}",
                    new.content_type.as_str()
                ),
            ));
        }

        Ok(new)
    }

    /// Validated `$set` document for the provided fields. File changes are applied by
    /// the caller since they need the media store.
    pub fn validate_update(&self, config: &Config) -> Result<bson::Document, Problem> {
        let mut set = bson::Document::new();
        if let Some(title) = &self.title {
            set.insert("title", validate::text("title", title, TITLE_MIN, TITLE_MAX)?);
        }
        if let Some(description) = &self.description {
            set.insert(
                "description",
                validate::text("description", description, 0, DESCRIPTION_MAX)?,
            );
        }
        if let Some(kind) = self.kind {
            set.insert("kind", bson::to_bson(&kind)?);
        }
        if let Some(value) = &self.subject {
            set.insert("subject", subject(value, config)?);
        }
        if let Some(grade) = self.grade {
            set.insert("grade", validate::grade(grade)? as i32);
        }
        if let Some(content_type) = self.content_type {
            set.insert("content_type", content_type);
        }
        if !self.tags.is_empty() {
            set.insert("tags", clean_tags(&self.tags));
        }
        if let Some(message) = &self.message {
            set.insert("message", message.trim());
        }
        if let Some(access) = self.access {
            set.insert("access", access.as_str());
        }
        if !self.allowed_students.is_empty() {
            set.insert(
                "allowed_students",
                self.allowed_students
                    .iter()
                    .map(|id| util::bson_uuid(*id))
                    .collect::<Vec<_>>(),
            );
        }
        if let Some(expires_at) = &self.expires_at {
            set.insert("expires_at", bson::DateTime::from_chrono(expiry(expires_at)?));
        }
        if let Some(allow) = self.allow_comments {
            set.insert("comment_settings.allow_comments", allow);
        }
        if let Some(only_teacher) = self.only_teacher_can_comment {
            set.insert("comment_settings.only_teacher_can_comment", only_teacher);
        }
        Ok(set)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReplyResponse {
    pub id: Uuid,
    pub user: Uuid,
    pub user_type: Role,
    pub author_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl From<Reply> for ReplyResponse {
    fn from(reply: Reply) -> Self {
        ReplyResponse {
            id: reply.id,
            user: reply.user,
            user_type: reply.user_type,
            author_name: reply.author_name,
            text: reply.text,
            created_at: reply.created_at.to_chrono(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CommentResponse {
    pub id: Uuid,
    pub user: Uuid,
    pub user_type: Role,
    pub author_name: String,
    pub text: String,
    pub replies: Vec<ReplyResponse>,
    pub created_at: DateTime<Utc>,
}

impl From<Comment> for CommentResponse {
    fn from(comment: Comment) -> Self {
        CommentResponse {
            id: comment.id,
            user: comment.user,
            user_type: comment.user_type,
            author_name: comment.author_name,
            text: comment.text,
            replies: comment.replies.into_iter().map(ReplyResponse::from).collect(),
            created_at: comment.created_at.to_chrono(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ContentResponse {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub kind: ContentKind,
    pub subject: String,
    pub grade: u8,
    pub content_type: ContentType,
    pub file: Option<StoredFile>,
    pub teacher: Uuid,
    pub tags: Vec<String>,
    pub message: String,
    pub access: Access,
    pub allowed_students: Vec<Uuid>,
    pub is_published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub comment_settings: CommentSettings,
    pub comment_count: usize,
    pub comments: Vec<CommentResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Content> for ContentResponse {
    fn from(content: Content) -> Self {
        ContentResponse {
            id: content.id,
            title: content.title,
            description: content.description,
            kind: content.kind,
            subject: content.subject,
            grade: content.grade,
            content_type: content.content_type,
            file: content.file,
            teacher: content.teacher,
            tags: content.tags,
            message: content.message,
            access: content.access,
            allowed_students: content.allowed_students,
            is_published: content.is_published,
            published_at: content.published_at.map(|it| it.to_chrono()),
            expires_at: content.expires_at.map(|it| it.to_chrono()),
            comment_settings: content.comment_settings,
            comment_count: content.comments.len(),
            comments: content
                .comments
                .into_iter()
                .map(CommentResponse::from)
                .collect(),
            created_at: content.created_at.to_chrono(),
            updated_at: content.updated_at.to_chrono(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use rocket::http::Status;

    pub(crate) fn lesson(teacher: Uuid) -> Content {
        NewContent {
            title: "Fractions".to_string(),
            description: "Adding fractions".to_string(),
            kind: ContentKind::Lecture,
            subject: "math".to_string(),
            grade: 5,
            content_type: ContentType::Text,
            tags: vec![],
            message: String::new(),
            access: Access::All,
            allowed_students: vec![],
            expires_at: None,
            comment_settings: CommentSettings::default(),
        }
        .into_content(teacher, None)
    }

    fn form() -> ContentForm<'static> {
        ContentForm {
            title: Some(" Fractions ".to_string()),
            description: Some("Adding fractions".to_string()),
            kind: None,
            subject: Some("Math".to_string()),
            grade: Some(5),
            content_type: Some(ContentType::Text),
            tags: vec!["  ".to_string(), "arith".to_string()],
            message: None,
            access: None,
            allowed_students: vec![],
            expires_at: None,
            allow_comments: None,
            only_teacher_can_comment: None,
            file: None,
        }
    }

    #[test]
    fn drafts_are_invisible() {
        let content = lesson(Uuid::new_v4());
        assert!(!content.is_visible_to(Uuid::new_v4(), Utc::now()));
    }

    #[test]
    fn expiry_hides_content() {
        let now = Utc::now();
        let mut content = lesson(Uuid::new_v4());
        content.is_published = true;
        assert!(content.is_visible_to(Uuid::new_v4(), now));

        content.expires_at = Some(bson::DateTime::from_chrono(now - Duration::minutes(1)));
        assert!(!content.is_live(now));
        content.expires_at = Some(bson::DateTime::from_chrono(now + Duration::days(1)));
        assert!(content.is_live(now));
    }

    #[test]
    fn specific_access_uses_allow_list() {
        let allowed = Uuid::new_v4();
        let mut content = lesson(Uuid::new_v4());
        content.is_published = true;
        content.access = Access::Specific;
        content.allowed_students = vec![allowed];

        assert!(content.is_visible_to(allowed, Utc::now()));
        assert!(!content.is_visible_to(Uuid::new_v4(), Utc::now()));
    }

    #[test]
    fn comment_settings_gate_roles() {
        let settings = CommentSettings::default();
        assert!(settings.check(Role::Student).is_ok());

        let teachers_only = CommentSettings {
            allow_comments: true,
            only_teacher_can_comment: true,
        };
        assert_eq!(
            teachers_only.check(Role::Student).unwrap_err().status,
            Status::Forbidden
        );
        assert!(teachers_only.check(Role::Teacher).is_ok());

        let closed = CommentSettings {
            allow_comments: false,
            only_teacher_can_comment: false,
        };
        assert!(closed.check(Role::Teacher).is_err());
    }

    #[test]
    fn comment_text_bounds() {
        assert_eq!(comment_text("  hi ").unwrap(), "hi");
        assert!(comment_text("   ").is_err());
        assert!(comment_text(&"x".repeat(COMMENT_MAX + 1)).is_err());
    }

    #[test]
    fn new_content_is_normalized() {
        let new = form().validate_new(&Config::for_tests()).expect("valid");
        assert_eq!(new.title, "Fractions");
        assert_eq!(new.subject, "math");
        assert_eq!(new.kind, ContentKind::Lecture);
        assert_eq!(new.tags, vec!["arith".to_string()]);
        assert_eq!(new.access, Access::All);
    }

    #[test]
    fn new_content_validation_failures() {
        let config = Config::for_tests();

        let mut missing = form();
        missing.description = None;
        assert_eq!(
            missing.validate_new(&config).unwrap_err().status,
            Status::BadRequest
        );

        let mut bad_subject = form();
        bad_subject.subject = Some("chemistry".to_string());
        assert!(bad_subject.validate_new(&config).is_err());

        let mut bad_grade = form();
        bad_grade.grade = Some(0);
        assert!(bad_grade.validate_new(&config).is_err());

        let mut needs_file = form();
        needs_file.content_type = Some(ContentType::Video);
        let problem = needs_file.validate_new(&config).unwrap_err();
        assert_eq!(problem.detail.as_deref(), Some("File is required for content type: video"));
    }

    #[test]
    fn update_only_sets_provided_fields() {
        let update = ContentForm {
            title: None,
            description: None,
            subject: None,
            grade: None,
            content_type: None,
            tags: vec![],
            expires_at: Some("2030-01-01T00:00:00Z".to_string()),
            allow_comments: Some(false),
            ..form()
        }
        .validate_update(&Config::for_tests())
        .expect("valid update");

        assert!(!update.contains_key("title"));
        assert!(update.contains_key("expires_at"));
        assert!(!update.get_bool("comment_settings.allow_comments").unwrap());
    }

    #[test]
    fn content_round_trips_through_bson() {
        let mut content = lesson(Uuid::new_v4());
        content.comments.push(Comment::new(
            Uuid::new_v4(),
            Role::Student,
            "Ann Lee".to_string(),
            "Nice".to_string(),
        ));
        let doc = bson::to_document(&content).unwrap();
        assert_eq!(doc.get_str("content_type").unwrap(), "text");
        assert_eq!(doc.get_str("access").unwrap(), "all");

        let back: Content = bson::from_document(doc).unwrap();
        assert_eq!(back.comments.len(), 1);
        assert_eq!(ContentResponse::from(back).comment_count, 1);
    }
}
