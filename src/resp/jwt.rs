use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Header, Validation};
use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::request::{self, FromRequest, Request};
use rocket::time::OffsetDateTime;
use serde::{Deserialize, Serialize};

use crate::data::user::User;
use crate::resp::problem::{problems, Problem};
use crate::role::Role;
use crate::security::{JwtKeys, Security};
use rocket::outcome::Outcome;
use uuid::Uuid;

pub static AUTH_COOKIE_NAME: &str = "jwt_auth";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRoleToken {
    #[serde(with = "date_time_as_unix_seconds")]
    iat: DateTime<Utc>,
    #[serde(with = "date_time_as_unix_seconds")]
    exp: DateTime<Utc>,
    pub user: Uuid,
    pub role: Role,
}

impl UserRoleToken {
    pub fn new(user: &User, lifetime: chrono::Duration) -> UserRoleToken {
        Self::for_user(user.id, user.role, lifetime)
    }

    pub fn for_user(user: Uuid, role: Role, lifetime: chrono::Duration) -> UserRoleToken {
        let now = Utc::now();
        UserRoleToken {
            iat: now,
            exp: now + lifetime,
            user,
            role,
        }
    }

    pub fn expires(&self) -> DateTime<Utc> {
        self.exp
    }

    pub fn encode_jwt(&self, keys: &JwtKeys) -> Result<String, jsonwebtoken::errors::Error> {
        encode(&Header::new(keys.algorithm), &self, &keys.encoding)
    }

    pub fn cookie(&self, keys: &JwtKeys) -> Result<Cookie<'static>, jsonwebtoken::errors::Error> {
        Ok(Cookie::build((AUTH_COOKIE_NAME, self.encode_jwt(keys)?))
            .secure(true)
            .same_site(SameSite::Lax)
            .expires(OffsetDateTime::from_unix_timestamp(self.exp.timestamp()).ok())
            .path("/")
            .http_only(true)
            .build())
    }

    /// Guards that only let a role through answer 403 to everyone else.
    pub fn require(&self, allowed: &[Role]) -> Result<(), Problem> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(problems::forbidden(format!(
                "Role '{}' can't access this resource.",
                self.role
            )))
        }
    }

    pub fn require_admin(&self) -> Result<(), Problem> {
        self.require(&[Role::Admin])
    }
}

pub fn auth_problem(detail: impl ToString) -> Problem {
    Problem::new_untyped(Status::Unauthorized, "Unable to authorize user.")
        .detail(detail)
        .clone()
}

pub fn decode_token(token: &str, keys: &JwtKeys) -> Result<UserRoleToken, Problem> {
    match decode::<UserRoleToken>(token, &keys.decoding, &Validation::new(keys.algorithm)) {
        Ok(data) => {
            tracing::debug!("decoded user role token for user: {}", data.claims.user);
            Ok(data.claims)
        }
        Err(e) => match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(Problem::from(e)),
            _ => Err(auth_problem("Invalid or expired token.")),
        },
    }
}

/// Bearer header wins over the cookie when both are present.
pub fn extract_claims(
    authorization: Option<&str>,
    cookies: &CookieJar,
    keys: &JwtKeys,
) -> Result<UserRoleToken, Problem> {
    if let Some(header) = authorization {
        return match header.strip_prefix("Bearer ") {
            Some(token) => decode_token(token.trim(), keys),
            None => Err(auth_problem("Authorization header must use the Bearer scheme.")),
        };
    }

    match cookies.get(AUTH_COOKIE_NAME) {
        Some(jwt) => {
            tracing::trace!("extracted jwt auth from cookie");
            decode_token(jwt.value(), keys)
        }
        None => Err(auth_problem("Access denied. No token provided.")),
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for UserRoleToken {
    type Error = Problem;

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let security = match req.rocket().state::<Security>() {
            Some(it) => it,
            None => {
                return Outcome::Error((
                    Status::InternalServerError,
                    Problem::new_untyped(Status::InternalServerError, "Security not configured."),
                ))
            }
        };

        tracing::trace!("extracting user role token from request");
        match extract_claims(
            req.headers().get_one("Authorization"),
            req.cookies(),
            &security.jwt_keys,
        ) {
            Ok(claims) => Outcome::Success(claims),
            Err(e) => {
                tracing::debug!("unable to extract claims: {}", e);
                Outcome::Error((Status::Unauthorized, e))
            }
        }
    }
}

pub mod date_time_as_unix_seconds {
    //! Custom serialization of DateTime<Utc> to conform to the JWT spec (RFC 7519 section 2, "Numeric Date")
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(date.timestamp())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Utc.timestamp_opt(i64::deserialize(deserializer)?, 0)
            .single()
            .ok_or_else(|| serde::de::Error::custom("Invalid Unix timestamp value."))
    }
}

pub mod doc {
    use utoipa::openapi::security::*;

    #[derive(Clone, Copy)]
    pub struct JWTAuth;

    impl From<JWTAuth> for SecurityScheme {
        fn from(_: JWTAuth) -> Self {
            let mut http = Http::new(HttpAuthScheme::Bearer);
            http.bearer_format = Some("JWT".to_string());
            SecurityScheme::Http(http)
        }
    }

    impl utoipa::Modify for JWTAuth {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            let components = openapi.components.get_or_insert_with(Default::default);
            components.add_security_scheme("jwt", *self)
        }
    }
}
