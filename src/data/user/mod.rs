use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::role::Role;
use crate::util;

pub mod db;
pub mod filter;

const BCRYPT_COST: u32 = 10;

pub const VERIFICATION_LIFETIME_MINUTES: i64 = 2 * 60;
pub const RESET_LIFETIME_MINUTES: i64 = 10;
pub const TWO_FACTOR_LIFETIME_MINUTES: i64 = 10;

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PasswordHash(String);

impl PasswordHash {
    pub fn new(password: impl AsRef<str>) -> Result<PasswordHash, bcrypt::BcryptError> {
        Ok(PasswordHash(bcrypt::hash(password.as_ref(), BCRYPT_COST)?))
    }

    pub fn matches(&self, password: impl AsRef<str>) -> bool {
        bcrypt::verify(password.as_ref(), &self.0).unwrap_or(false)
    }
}

/// Hashed, time-boxed, single-use secret such as an email verification link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneTimeToken {
    pub hash: String,
    pub expires: bson::DateTime,
}

impl OneTimeToken {
    /// Returns the raw token to hand out together with its stored form.
    pub fn issue(lifetime_minutes: i64) -> (String, OneTimeToken) {
        let raw = util::random_token(32);
        let token = Self::from_raw(&raw, lifetime_minutes);
        (raw, token)
    }

    /// Six digit code for emailed two-factor login.
    pub fn issue_code(lifetime_minutes: i64) -> (String, OneTimeToken) {
        use rand::Rng;

        let raw = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        let token = Self::from_raw(&raw, lifetime_minutes);
        (raw, token)
    }

    fn from_raw(raw: &str, lifetime_minutes: i64) -> OneTimeToken {
        OneTimeToken {
            hash: util::sha256_token(raw),
            expires: bson::DateTime::from_chrono(
                Utc::now() + chrono::Duration::minutes(lifetime_minutes),
            ),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.to_chrono() <= now
    }

    pub fn matches(&self, raw: &str, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.hash == util::sha256_token(raw.trim())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Relationship {
    Father,
    Mother,
    Guardian,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StudentProfile {
    pub student_id: String,
    pub grade: u8,
    #[serde(default)]
    pub date_of_birth: Option<chrono::NaiveDate>,
    #[serde(default, with = "util::serde_uuid::vec")]
    #[schema(value_type = Vec<String>)]
    pub parents: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TeacherProfile {
    pub employee_id: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub department: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ParentProfile {
    pub relationship: Relationship,
    #[serde(default, with = "util::serde_uuid::vec")]
    #[schema(value_type = Vec<String>)]
    pub children: Vec<Uuid>,
}

/// Role specific part of a user. Every role shares the `users` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Student(StudentProfile),
    Teacher(TeacherProfile),
    Parent(ParentProfile),
    Admin,
}

impl Profile {
    pub fn role(&self) -> Role {
        match self {
            Profile::Student(_) => Role::Student,
            Profile::Teacher(_) => Role::Teacher,
            Profile::Parent(_) => Role::Parent,
            Profile::Admin => Role::Admin,
        }
    }

    pub fn grade(&self) -> Option<u8> {
        match self {
            Profile::Student(student) => Some(student.grade),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id", with = "bson::serde_helpers::uuid_1_as_binary")]
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub pw_hash: PasswordHash,
    pub role: Role,
    pub profile: Profile,

    #[serde(default)]
    pub is_verified: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub two_factor_enabled: bool,

    #[serde(default)]
    pub email_verification: Option<OneTimeToken>,
    #[serde(default)]
    pub password_reset: Option<OneTimeToken>,
    #[serde(default)]
    pub two_factor: Option<OneTimeToken>,

    #[serde(default)]
    pub last_login: Option<bson::DateTime>,
    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

fn default_true() -> bool {
    true
}

impl User {
    pub fn new(
        email: impl ToString,
        first_name: impl ToString,
        last_name: impl ToString,
        phone_number: impl ToString,
        pw_hash: PasswordHash,
        profile: Profile,
    ) -> User {
        let id = Uuid::new_v4();
        tracing::info!("Creating a new user with UUID: {}", id);

        let now = bson::DateTime::now();
        User {
            id,
            email: email.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            phone_number: phone_number.to_string(),
            pw_hash,
            role: profile.role(),
            profile,
            is_verified: false,
            is_active: true,
            two_factor_enabled: false,
            email_verification: None,
            password_reset: None,
            two_factor: None,
            last_login: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub role: Role,
    pub profile: Profile,
    pub is_verified: bool,
    pub is_active: bool,
    pub two_factor_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        UserResponse {
            id: user.id,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            phone_number: user.phone_number,
            role: user.role,
            profile: user.profile,
            is_verified: user.is_verified,
            is_active: user.is_active,
            two_factor_enabled: user.two_factor_enabled,
            created_at: user.created_at.to_chrono(),
            last_login: user.last_login.map(|it| it.to_chrono()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student() -> Profile {
        Profile::Student(StudentProfile {
            student_id: util::short_identifier("STU"),
            grade: 10,
            date_of_birth: None,
            parents: vec![],
        })
    }

    #[test]
    fn passwords_hash_and_verify() {
        let hash = PasswordHash::new("Str0ng!pass").expect("hashing works");
        assert!(hash.matches("Str0ng!pass"));
        assert!(!hash.matches("Str0ng!pasS"));
    }

    #[test]
    fn one_time_tokens_are_time_boxed() {
        let (raw, token) = OneTimeToken::issue(10);
        let now = Utc::now();
        assert!(token.matches(&raw, now));
        assert!(!token.matches("something-else", now));
        assert!(!token.matches(&raw, now + chrono::Duration::minutes(11)));
    }

    #[test]
    fn two_factor_codes_are_six_digits() {
        let (code, token) = OneTimeToken::issue_code(TWO_FACTOR_LIFETIME_MINUTES);
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        assert!(token.matches(&format!(" {} ", code), Utc::now()));
    }

    #[test]
    fn user_role_follows_profile() {
        let hash = PasswordHash("unused".to_string());
        let user = User::new("a@b.co", "Ann", "Lee", "5550102030", hash, student());
        assert_eq!(user.role, Role::Student);
        assert_eq!(user.profile.grade(), Some(10));
        assert_eq!(user.full_name(), "Ann Lee");
    }

    #[test]
    fn user_round_trips_through_bson() {
        let hash = PasswordHash("unused".to_string());
        let mut user = User::new("a@b.co", "Ann", "Lee", "5550102030", hash, student());
        user.email_verification = Some(OneTimeToken::issue(5).1);

        let doc = bson::to_document(&user).expect("serializable");
        assert!(matches!(doc.get("_id"), Some(bson::Bson::Binary(_))));
        assert_eq!(doc.get_str("role").unwrap(), "student");

        let back: User = bson::from_document(doc).expect("deserializable");
        assert_eq!(back.id, user.id);
        assert_eq!(back.profile, user.profile);
        assert_eq!(back.email_verification, user.email_verification);
    }
}
