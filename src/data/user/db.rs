use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument};
use mongodb::Database;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::Config;
use crate::data::validate;
use crate::resp::problem::Problem;
use crate::role::Role;
use crate::util;

use super::filter;
use super::{
    OneTimeToken, ParentProfile, PasswordHash, Profile, Relationship, StudentProfile,
    TeacherProfile, User,
};

pub static USER_COLLECTION_NAME: &str = "users";

pub mod problem {
    use crate::resp::problem::Problem;
    use rocket::http::Status;
    use uuid::Uuid;

    #[inline]
    pub fn email_taken(email: impl ToString) -> Problem {
        Problem::new_untyped(Status::BadRequest, "Email is already in use.")
            .insert_str("email", email)
            .to_owned()
    }

    #[inline]
    pub fn not_found(id: Uuid) -> Problem {
        Problem::new_untyped(Status::NotFound, "User doesn't exist.")
            .insert("id", id.to_string())
            .clone()
    }

    #[inline]
    pub fn unknown_email() -> Problem {
        Problem::new_untyped(Status::NotFound, "No user found with that email.")
    }

    #[inline]
    pub fn bad_login() -> Problem {
        Problem::new_untyped(Status::Unauthorized, "Bad email or password.")
    }

    #[inline]
    pub fn not_verified() -> Problem {
        Problem::new_untyped(Status::Forbidden, "Email address is not verified.")
            .detail("Verify your email address before logging in.")
            .to_owned()
    }

    #[inline]
    pub fn deactivated() -> Problem {
        Problem::new_untyped(Status::Forbidden, "Account is deactivated.")
    }

    #[inline]
    pub fn already_verified() -> Problem {
        Problem::new_untyped(Status::BadRequest, "Email is already verified.")
    }

    #[inline]
    pub fn bad_token() -> Problem {
        Problem::new_untyped(Status::BadRequest, "Token is invalid or has expired.")
    }
}

/// Which one-time token slot of a [`User`] an operation targets.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TokenKind {
    EmailVerification,
    PasswordReset,
    TwoFactor,
}

impl TokenKind {
    pub fn field(self) -> &'static str {
        match self {
            TokenKind::EmailVerification => "email_verification",
            TokenKind::PasswordReset => "password_reset",
            TokenKind::TwoFactor => "two_factor",
        }
    }
}

#[derive(Clone, Deserialize, ToSchema)]
pub struct SignupData {
    #[schema(format = "email")]
    pub email: String,
    #[schema(format = "password")]
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,

    /// Defaults to `teacher`. Admin accounts come from configuration only.
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub grade: Option<u8>,
    #[serde(default)]
    pub date_of_birth: Option<chrono::NaiveDate>,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub relationship: Option<Relationship>,
}

impl std::fmt::Debug for SignupData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignupData:{}", self.email)
    }
}

impl SignupData {
    pub fn validate(&self) -> Result<(), Problem> {
        validate::text("first_name", &self.first_name, 2, 50)?;
        validate::text("last_name", &self.last_name, 2, 50)?;
        validate::email(&self.email)?;
        validate::password(&self.password)?;
        validate::phone(&self.phone_number)?;

        if let Some(Role::Admin) = self.role {
            return Err(crate::resp::problem::problems::invalid_field(
                "role",
                "Admin accounts can't be created through signup.",
            ));
        }
        if self.role == Some(Role::Student) {
            validate::grade(validate::required_value("grade", self.grade)?)?;
        }

        Ok(())
    }

    /// Builds the stored user. Emails listed as admin in `config` become admins.
    pub fn into_user(self, config: &Config) -> Result<User, Problem> {
        let email = validate::email(&self.email)?;

        let profile = if config.is_admin_email(&email) {
            Profile::Admin
        } else {
            match self.role.unwrap_or(Role::Teacher) {
                Role::Student => Profile::Student(StudentProfile {
                    student_id: util::short_identifier("STU"),
                    grade: validate::grade(validate::required_value("grade", self.grade)?)?,
                    date_of_birth: self.date_of_birth,
                    parents: vec![],
                }),
                Role::Parent => Profile::Parent(ParentProfile {
                    relationship: self.relationship.unwrap_or(Relationship::Guardian),
                    children: vec![],
                }),
                Role::Teacher | Role::Admin => Profile::Teacher(TeacherProfile {
                    employee_id: util::short_identifier("EMP"),
                    subjects: self
                        .subjects
                        .iter()
                        .map(|it| it.trim().to_lowercase())
                        .filter(|it| !it.is_empty())
                        .collect(),
                    department: self.department.clone(),
                }),
            }
        };

        let mut user = User::new(
            email,
            self.first_name.trim(),
            self.last_name.trim(),
            self.phone_number.trim(),
            PasswordHash::new(&self.password)?,
            profile,
        );
        user.two_factor_enabled = config.two_factor_default;

        Ok(user)
    }
}

#[derive(Clone, Deserialize, ToSchema)]
pub struct LoginData {
    #[schema(format = "email")]
    pub email: String,
    #[schema(format = "password")]
    pub password: String,
}

impl std::fmt::Debug for LoginData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LoginData:{}", self.email)
    }
}

impl LoginData {
    /// Shape checks only. Anything that can't be a valid credential is a bad login.
    pub fn validate(&self) -> Result<(), Problem> {
        let length = self.password.chars().count();
        if validate::email(&self.email).is_err()
            || !(validate::PASSWORD_MIN..=validate::PASSWORD_MAX).contains(&length)
        {
            return Err(problem::bad_login());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct TwoFactorData {
    #[schema(format = "email")]
    pub email: String,
    pub code: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct EmailData {
    #[serde(default)]
    #[schema(format = "email")]
    pub email: Option<String>,
}

#[derive(Clone, Deserialize, ToSchema)]
pub struct PasswordData {
    #[serde(default)]
    #[schema(format = "password")]
    pub password: Option<String>,
}

impl std::fmt::Debug for PasswordData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordData")
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ProfileUpdateData {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[schema(format = "email")]
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

impl ProfileUpdateData {
    /// Validated `$set` document for the provided fields.
    pub fn to_update(&self) -> Result<Document, Problem> {
        let mut set = Document::new();
        if let Some(first_name) = &self.first_name {
            set.insert("first_name", validate::text("first_name", first_name, 2, 50)?);
        }
        if let Some(last_name) = &self.last_name {
            set.insert("last_name", validate::text("last_name", last_name, 2, 50)?);
        }
        if let Some(email) = &self.email {
            set.insert("email", validate::email(email)?);
        }
        if let Some(phone) = &self.phone_number {
            set.insert("phone_number", validate::phone(phone)?);
        }
        Ok(set)
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct AdminUserUpdate {
    #[serde(flatten)]
    pub profile: ProfileUpdateData,
    pub role: Option<Role>,
    /// Required when the role changes to `student`.
    pub grade: Option<u8>,
    pub two_factor_enabled: Option<bool>,
    pub is_active: Option<bool>,
    pub is_verified: Option<bool>,
}

impl AdminUserUpdate {
    pub fn is_empty(&self) -> bool {
        let p = &self.profile;
        p.first_name.is_none()
            && p.last_name.is_none()
            && p.email.is_none()
            && p.phone_number.is_none()
            && self.role.is_none()
            && self.grade.is_none()
            && self.two_factor_enabled.is_none()
            && self.is_active.is_none()
            && self.is_verified.is_none()
    }

    /// Validated `$set` document against the stored profile. A role change
    /// replaces the profile with one for the new role.
    pub fn to_update(&self, current: &Profile) -> Result<Document, Problem> {
        let mut set = self.profile.to_update()?;
        if let Some(profile) = self.changed_profile(current)? {
            set.insert("role", profile.role());
            set.insert("profile", bson::to_bson(&profile)?);
        }
        if let Some(enabled) = self.two_factor_enabled {
            set.insert("two_factor_enabled", enabled);
        }
        if let Some(active) = self.is_active {
            set.insert("is_active", active);
        }
        if let Some(verified) = self.is_verified {
            set.insert("is_verified", verified);
        }
        Ok(set)
    }

    fn changed_profile(&self, current: &Profile) -> Result<Option<Profile>, Problem> {
        let role = self.role.unwrap_or_else(|| current.role());
        if self.grade.is_some() && role != Role::Student {
            return Err(crate::resp::problem::problems::invalid_field(
                "grade",
                "Only students have a grade.",
            ));
        }

        let profile = match (role, current) {
            (Role::Student, Profile::Student(student)) => match self.grade {
                Some(grade) => Profile::Student(StudentProfile {
                    grade: validate::grade(grade)?,
                    ..student.clone()
                }),
                None => return Ok(None),
            },
            (Role::Student, _) => Profile::Student(StudentProfile {
                student_id: util::short_identifier("STU"),
                grade: validate::grade(validate::required_value("grade", self.grade)?)?,
                date_of_birth: None,
                parents: vec![],
            }),
            (role, current) if role == current.role() => return Ok(None),
            (Role::Teacher, _) => Profile::Teacher(TeacherProfile {
                employee_id: util::short_identifier("EMP"),
                subjects: vec![],
                department: None,
            }),
            (Role::Parent, _) => Profile::Parent(ParentProfile {
                relationship: Relationship::Guardian,
                children: vec![],
            }),
            (Role::Admin, _) => Profile::Admin,
        };
        Ok(Some(profile))
    }
}

/// Unique index violations on `users` can only come from the email index.
fn email_conflict(e: mongodb::error::Error, email: Option<&str>) -> Problem {
    match email {
        Some(email) if crate::db::is_duplicate_key(&e) => problem::email_taken(email),
        _ => e.into(),
    }
}

#[rocket::async_trait]
pub trait UserDbExt {
    async fn create_user(&self, user: &User) -> Result<(), Problem>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, Problem>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, Problem>;
    async fn find_user_by_token(&self, kind: TokenKind, raw: &str)
        -> Result<Option<User>, Problem>;

    async fn set_token(&self, id: Uuid, kind: TokenKind, token: &OneTimeToken)
        -> Result<(), Problem>;

    async fn mark_verified(&self, id: Uuid) -> Result<(), Problem>;
    async fn set_password(&self, id: Uuid, hash: &PasswordHash) -> Result<(), Problem>;
    async fn set_two_factor(&self, id: Uuid, enabled: bool) -> Result<(), Problem>;
    async fn record_login(&self, id: Uuid) -> Result<(), Problem>;

    /// Applies a `$set` document and returns the updated user.
    async fn update_user(&self, id: Uuid, set: Document) -> Result<Option<User>, Problem>;

    async fn list_users(&self, filter: Document, skip: u64, limit: u32)
        -> Result<Vec<User>, Problem>;
    async fn count_users(&self, filter: Document) -> Result<u64, Problem>;

    async fn delete_user(&self, id: Uuid) -> Result<Option<User>, Problem>;
}

fn users(db: &Database) -> mongodb::Collection<User> {
    db.collection(USER_COLLECTION_NAME)
}

#[rocket::async_trait]
impl UserDbExt for Database {
    async fn create_user(&self, user: &User) -> Result<(), Problem> {
        if self.find_user_by_email(&user.email).await?.is_some() {
            return Err(problem::email_taken(&user.email));
        }

        // a concurrent signup with the same email loses on the unique index
        users(self)
            .insert_one(user, None)
            .await
            .map_err(|e| email_conflict(e, Some(&user.email)))?;
        tracing::info!("stored user {} with role {}", user.id, user.role);
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, Problem> {
        users(self)
            .find_one(filter::by_id(id), None)
            .await
            .map_err(Problem::from)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, Problem> {
        users(self)
            .find_one(filter::by_email(email), None)
            .await
            .map_err(Problem::from)
    }

    async fn find_user_by_token(
        &self,
        kind: TokenKind,
        raw: &str,
    ) -> Result<Option<User>, Problem> {
        users(self)
            .find_one(filter::by_token(kind.field(), raw), None)
            .await
            .map_err(Problem::from)
    }

    async fn set_token(
        &self,
        id: Uuid,
        kind: TokenKind,
        token: &OneTimeToken,
    ) -> Result<(), Problem> {
        let mut set = Document::new();
        set.insert(kind.field(), bson::to_bson(token)?);
        set.insert("updated_at", bson::DateTime::now());

        users(self)
            .update_one(filter::by_id(id), doc! { "$set": set }, None)
            .await?;
        Ok(())
    }

    async fn mark_verified(&self, id: Uuid) -> Result<(), Problem> {
        users(self)
            .update_one(
                filter::by_id(id),
                doc! {
                    "$set": { "is_verified": true, "updated_at": bson::DateTime::now() },
                    "$unset": { "email_verification": "" },
                },
                None,
            )
            .await?;
        Ok(())
    }

    async fn set_password(&self, id: Uuid, hash: &PasswordHash) -> Result<(), Problem> {
        users(self)
            .update_one(
                filter::by_id(id),
                doc! {
                    "$set": { "pw_hash": bson::to_bson(hash)?, "updated_at": bson::DateTime::now() },
                    "$unset": { "password_reset": "" },
                },
                None,
            )
            .await?;
        Ok(())
    }

    async fn set_two_factor(&self, id: Uuid, enabled: bool) -> Result<(), Problem> {
        users(self)
            .update_one(
                filter::by_id(id),
                doc! {
                    "$set": { "two_factor_enabled": enabled, "updated_at": bson::DateTime::now() },
                    "$unset": { "two_factor": "" },
                },
                None,
            )
            .await?;
        Ok(())
    }

    async fn record_login(&self, id: Uuid) -> Result<(), Problem> {
        users(self)
            .update_one(
                filter::by_id(id),
                doc! {
                    "$set": { "last_login": bson::DateTime::now() },
                    "$unset": { "two_factor": "" },
                },
                None,
            )
            .await?;
        Ok(())
    }

    async fn update_user(&self, id: Uuid, mut set: Document) -> Result<Option<User>, Problem> {
        let email = set.get_str("email").ok().map(str::to_string);
        if let Some(email) = &email {
            if let Some(existing) = self.find_user_by_email(email).await? {
                if existing.id != id {
                    return Err(problem::email_taken(email));
                }
            }
        }

        set.insert("updated_at", bson::DateTime::now());
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        users(self)
            .find_one_and_update(filter::by_id(id), doc! { "$set": set }, options)
            .await
            .map_err(|e| email_conflict(e, email.as_deref()))
    }

    async fn list_users(
        &self,
        filter: Document,
        skip: u64,
        limit: u32,
    ) -> Result<Vec<User>, Problem> {
        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .skip(skip)
            .limit(limit as i64)
            .build();

        let cursor = users(self).find(filter, options).await?;
        cursor.try_collect().await.map_err(Problem::from)
    }

    async fn count_users(&self, filter: Document) -> Result<u64, Problem> {
        users(self)
            .count_documents(filter, None)
            .await
            .map_err(Problem::from)
    }

    async fn delete_user(&self, id: Uuid) -> Result<Option<User>, Problem> {
        users(self)
            .find_one_and_delete(filter::by_id(id), None)
            .await
            .map_err(Problem::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::http::Status;

    fn signup(role: Option<Role>) -> SignupData {
        SignupData {
            email: "Jane.Doe@School.edu".to_string(),
            password: "Str0ng!pass".to_string(),
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            phone_number: "5550102030".to_string(),
            role,
            grade: Some(9),
            date_of_birth: None,
            subjects: vec![" Math ".to_string()],
            department: None,
            relationship: None,
        }
    }

    #[test]
    fn signup_defaults_to_teacher() {
        let data = signup(None);
        data.validate().expect("valid signup");
        let user = data.into_user(&Config::for_tests()).expect("user");

        assert_eq!(user.email, "jane.doe@school.edu");
        assert_eq!(user.role, Role::Teacher);
        assert!(!user.is_verified);
        assert!(user.two_factor_enabled);
        match user.profile {
            Profile::Teacher(teacher) => {
                assert!(teacher.employee_id.starts_with("EMP-"));
                assert_eq!(teacher.subjects, vec!["math".to_string()]);
            }
            other => panic!("unexpected profile {:?}", other),
        }
    }

    #[test]
    fn students_need_a_grade() {
        let mut data = signup(Some(Role::Student));
        data.validate().expect("valid student");
        data.grade = None;
        assert_eq!(data.validate().unwrap_err().status, Status::BadRequest);
        data.grade = Some(13);
        assert!(data.validate().is_err());
    }

    #[test]
    fn admin_role_comes_from_configuration() {
        assert!(signup(Some(Role::Admin)).validate().is_err());

        let mut data = signup(None);
        data.email = "ADMIN@example.com".to_string();
        let user = data.into_user(&Config::for_tests()).unwrap();
        assert_eq!(user.role, Role::Admin);
    }

    #[test]
    fn signup_rejects_weak_passwords() {
        let mut data = signup(None);
        data.password = "password".to_string();
        assert!(data.validate().is_err());
    }

    #[test]
    fn malformed_login_is_unauthorized() {
        let login = LoginData {
            email: "nobody".to_string(),
            password: "whatever1!A".to_string(),
        };
        assert_eq!(login.validate().unwrap_err().status, Status::Unauthorized);
    }

    fn teacher_profile() -> Profile {
        Profile::Teacher(TeacherProfile {
            employee_id: "EMP-TEST".to_string(),
            subjects: vec!["math".to_string()],
            department: None,
        })
    }

    #[test]
    fn admin_update_builds_set_document() {
        let update = AdminUserUpdate {
            profile: ProfileUpdateData {
                email: Some("New@Example.com".to_string()),
                ..Default::default()
            },
            role: Some(Role::Parent),
            two_factor_enabled: Some(false),
            ..Default::default()
        };
        let set = update.to_update(&teacher_profile()).unwrap();
        assert_eq!(set.get_str("email").unwrap(), "new@example.com");
        assert_eq!(set.get_str("role").unwrap(), "parent");
        assert!(!set.get_bool("two_factor_enabled").unwrap());
        assert!(!set.contains_key("is_active"));

        let profile: Profile = bson::from_bson(set.get("profile").unwrap().clone()).unwrap();
        assert_eq!(profile.role(), Role::Parent);
    }

    #[test]
    fn role_change_rebuilds_the_profile() {
        let update = AdminUserUpdate {
            role: Some(Role::Student),
            grade: Some(7),
            ..Default::default()
        };
        let set = update.to_update(&teacher_profile()).unwrap();
        let role: Role = bson::from_bson(set.get("role").unwrap().clone()).unwrap();
        let profile: Profile = bson::from_bson(set.get("profile").unwrap().clone()).unwrap();

        assert_eq!(role, profile.role());
        assert_eq!(profile.grade(), Some(7));
        match profile {
            Profile::Student(student) => assert!(student.student_id.starts_with("STU-")),
            other => panic!("unexpected profile {:?}", other),
        }
    }

    #[test]
    fn becoming_a_student_needs_a_grade() {
        let update = AdminUserUpdate {
            role: Some(Role::Student),
            ..Default::default()
        };
        let err = update.to_update(&teacher_profile()).unwrap_err();
        assert_eq!(err.status, Status::BadRequest);

        let teacher_grade = AdminUserUpdate {
            grade: Some(5),
            ..Default::default()
        };
        assert!(teacher_grade.to_update(&teacher_profile()).is_err());
    }

    #[test]
    fn same_role_keeps_the_profile() {
        let update = AdminUserUpdate {
            role: Some(Role::Teacher),
            ..Default::default()
        };
        let set = update.to_update(&teacher_profile()).unwrap();
        assert!(!set.contains_key("role"));
        assert!(!set.contains_key("profile"));

        let student = Profile::Student(StudentProfile {
            student_id: "STU-TEST".to_string(),
            grade: 4,
            date_of_birth: None,
            parents: vec![],
        });
        let regrade = AdminUserUpdate {
            grade: Some(5),
            ..Default::default()
        };
        let profile: Profile = bson::from_bson(
            regrade.to_update(&student).unwrap().get("profile").unwrap().clone(),
        )
        .unwrap();
        assert_eq!(profile.grade(), Some(5));
        match profile {
            Profile::Student(it) => assert_eq!(it.student_id, "STU-TEST"),
            other => panic!("unexpected profile {:?}", other),
        }
    }

    #[test]
    fn profile_update_validates_fields() {
        let update = ProfileUpdateData {
            first_name: Some("J".to_string()),
            ..Default::default()
        };
        assert!(update.to_update().is_err());
    }
}
