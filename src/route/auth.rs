use chrono::{DateTime, Utc};
use mongodb::Database;
use rocket::http::{Cookie, CookieJar, Status};
use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::Config;
use crate::data::user::db::problem as user_problem;
use crate::data::user::db::{
    EmailData, LoginData, PasswordData, ProfileUpdateData, SignupData, TokenKind, TwoFactorData,
    UserDbExt,
};
use crate::data::user::{
    OneTimeToken, PasswordHash, User, UserResponse, RESET_LIFETIME_MINUTES,
    TWO_FACTOR_LIFETIME_MINUTES, VERIFICATION_LIFETIME_MINUTES,
};
use crate::data::validate;
use crate::resp::jwt::{UserRoleToken, AUTH_COOKIE_NAME};
use crate::resp::problem::{problems, Problem};
use crate::security::Security;
use crate::service::mail::{self, Email, Mail};

use super::MessageResponse;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SignupResponse {
    pub message: String,
    pub user: UserResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthResponse {
    pub token: String,
    pub expires: DateTime<Utc>,
    pub user: UserResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TwoFactorPending {
    pub message: String,
    pub email: String,
    pub two_factor_required: bool,
}

#[derive(Debug, Responder)]
pub enum LoginResponse {
    #[response(status = 200)]
    LoggedIn(Json<AuthResponse>),
    /// Credentials were fine, a login code was emailed.
    #[response(status = 202)]
    CodeSent(Json<TwoFactorPending>),
}

fn start_session(
    user: User,
    security: &Security,
    cookies: &CookieJar<'_>,
) -> Result<AuthResponse, Problem> {
    let urt = UserRoleToken::new(&user, security.token_lifetime);
    cookies.add(urt.cookie(&security.jwt_keys)?);

    Ok(AuthResponse {
        token: urt.encode_jwt(&security.jwt_keys)?,
        expires: urt.expires(),
        user: user.into(),
    })
}

async fn send_verification(mailer: &Mail, config: &Config, user: &User, raw: &str) {
    let link = config.api_link(&format!("auth/verify-email/{}", raw));
    mail::send_logged(
        mailer.as_ref(),
        Email::verification(&user.email, &user.first_name, &link),
    )
    .await;
}

/// Register a new account and email a verification link
#[utoipa::path(
    request_body = SignupData,
    responses(
        (status = 201, description = "Account created", body = SignupResponse),
        (status = 400, description = "Invalid data or email in use", body = Problem),
    )
)]
#[post("/auth/signup", format = "json", data = "<signup>")]
#[tracing::instrument(skip(db, config, mailer))]
pub async fn signup(
    signup: Json<SignupData>,
    db: &State<Database>,
    config: &State<Config>,
    mailer: &State<Mail>,
) -> Result<(Status, Json<SignupResponse>), Problem> {
    signup.validate()?;

    let mut user = signup.into_inner().into_user(config)?;
    let (raw, token) = OneTimeToken::issue(VERIFICATION_LIFETIME_MINUTES);
    user.email_verification = Some(token);

    db.create_user(&user).await?;
    send_verification(mailer, config, &user, &raw).await;

    Ok((
        Status::Created,
        Json(SignupResponse {
            message: "User registered successfully. Please verify your email.".to_string(),
            user: user.into(),
        }),
    ))
}

/// Confirm an email address with the emailed token
#[utoipa::path(
    responses(
        (status = 200, body = MessageResponse),
        (status = 400, description = "Token is invalid or expired", body = Problem),
    )
)]
#[get("/auth/verify-email/<token>")]
#[tracing::instrument(skip(token, db))]
pub async fn verify_email(
    token: &str,
    db: &State<Database>,
) -> Result<Json<MessageResponse>, Problem> {
    let user = db
        .find_user_by_token(TokenKind::EmailVerification, token)
        .await?
        .ok_or_else(user_problem::bad_token)?;

    if user.is_verified {
        return Err(user_problem::already_verified());
    }

    db.mark_verified(user.id).await?;
    tracing::info!("verified email of user {}", user.id);

    Ok(Json(MessageResponse::new("Email verified successfully.")))
}

/// Issue a new verification link
#[utoipa::path(
    request_body = EmailData,
    responses(
        (status = 200, body = MessageResponse),
        (status = 400, body = Problem),
        (status = 404, body = Problem),
    )
)]
#[post("/auth/resend-verification", format = "json", data = "<data>")]
#[tracing::instrument(skip(db, config, mailer))]
pub async fn resend_verification(
    data: Json<EmailData>,
    db: &State<Database>,
    config: &State<Config>,
    mailer: &State<Mail>,
) -> Result<Json<MessageResponse>, Problem> {
    let email = validate::required("email", data.email.as_deref())?;

    let user = db
        .find_user_by_email(email)
        .await?
        .ok_or_else(user_problem::unknown_email)?;
    if user.is_verified {
        return Err(user_problem::already_verified());
    }

    let (raw, token) = OneTimeToken::issue(VERIFICATION_LIFETIME_MINUTES);
    db.set_token(user.id, TokenKind::EmailVerification, &token)
        .await?;
    send_verification(mailer, config, &user, &raw).await;

    Ok(Json(MessageResponse::new(
        "Verification email sent successfully.",
    )))
}

/// Log in with email and password
///
/// Accounts with two-factor authentication get a code by email instead of a token.
#[utoipa::path(
    request_body = LoginData,
    responses(
        (status = 200, description = "Logged in", body = AuthResponse),
        (status = 202, description = "Login code sent", body = TwoFactorPending),
        (status = 401, description = "Bad credentials", body = Problem),
        (status = 403, description = "Unverified or deactivated", body = Problem),
    )
)]
#[post("/auth/login", format = "json", data = "<login>")]
#[tracing::instrument(skip(db, security, mailer, cookies))]
pub async fn login(
    login: Json<LoginData>,
    cookies: &CookieJar<'_>,
    db: &State<Database>,
    security: &State<Security>,
    mailer: &State<Mail>,
) -> Result<LoginResponse, Problem> {
    login.validate()?;

    // VULN: no throttling of repeated failed logins
    let user = db
        .find_user_by_email(&login.email)
        .await?
        .ok_or_else(user_problem::bad_login)?;

    if !user.pw_hash.matches(&login.password) {
        return Err(user_problem::bad_login());
    }
    if !user.is_active {
        return Err(user_problem::deactivated());
    }
    if !user.is_verified {
        return Err(user_problem::not_verified());
    }

    if user.two_factor_enabled {
        let (code, token) = OneTimeToken::issue_code(TWO_FACTOR_LIFETIME_MINUTES);
        db.set_token(user.id, TokenKind::TwoFactor, &token).await?;
        mail::send_logged(
            mailer.inner().as_ref(),
            Email::two_factor_code(&user.email, &user.first_name, &code),
        )
        .await;

        return Ok(LoginResponse::CodeSent(Json(TwoFactorPending {
            message: "A login code was sent to your email.".to_string(),
            email: user.email,
            two_factor_required: true,
        })));
    }

    db.record_login(user.id).await?;
    Ok(LoginResponse::LoggedIn(Json(start_session(
        user, security, cookies,
    )?)))
}

/// Finish a two-factor login with the emailed code
#[utoipa::path(
    request_body = TwoFactorData,
    responses(
        (status = 200, body = AuthResponse),
        (status = 400, description = "Code is invalid or expired", body = Problem),
    )
)]
#[post("/auth/verify-2fa", format = "json", data = "<data>")]
#[tracing::instrument(skip(data, db, security, cookies))]
pub async fn verify_two_factor(
    data: Json<TwoFactorData>,
    cookies: &CookieJar<'_>,
    db: &State<Database>,
    security: &State<Security>,
) -> Result<Json<AuthResponse>, Problem> {
    let user = db
        .find_user_by_email(&data.email)
        .await?
        .ok_or_else(user_problem::bad_token)?;

    let valid = user
        .two_factor
        .as_ref()
        .map(|it| it.matches(&data.code, Utc::now()))
        .unwrap_or(false);
    if !valid {
        return Err(user_problem::bad_token());
    }

    db.record_login(user.id).await?;
    Ok(Json(start_session(user, security, cookies)?))
}

async fn switch_two_factor(
    auth: &UserRoleToken,
    db: &Database,
    enabled: bool,
) -> Result<(), Problem> {
    let user = db
        .get_user(auth.user)
        .await?
        .ok_or_else(|| user_problem::not_found(auth.user))?;

    if enabled && user.two_factor_enabled {
        return Err(problems::bad_request(
            "Two-factor authentication is already enabled.",
        ));
    }
    db.set_two_factor(user.id, enabled).await
}

/// Turn on emailed login codes for the current user
#[utoipa::path(
    responses((status = 200, body = MessageResponse), (status = 400, body = Problem)),
    security(("jwt" = []))
)]
#[post("/auth/enable-2fa")]
#[tracing::instrument(skip(db))]
pub async fn enable_two_factor(
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<MessageResponse>, Problem> {
    switch_two_factor(&auth, db, true).await?;
    Ok(Json(MessageResponse::new(
        "Two-factor authentication enabled successfully.",
    )))
}

/// Turn off emailed login codes for the current user
#[utoipa::path(responses((status = 200, body = MessageResponse)), security(("jwt" = [])))]
#[post("/auth/disable-2fa")]
#[tracing::instrument(skip(db))]
pub async fn disable_two_factor(
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<MessageResponse>, Problem> {
    switch_two_factor(&auth, db, false).await?;
    Ok(Json(MessageResponse::new(
        "Two-factor authentication disabled successfully.",
    )))
}

/// Email a password reset link
#[utoipa::path(
    request_body = EmailData,
    responses(
        (status = 200, body = MessageResponse),
        (status = 404, description = "No user with that email", body = Problem),
    )
)]
#[post("/auth/forgot-password", format = "json", data = "<data>")]
#[tracing::instrument(skip(db, config, mailer))]
pub async fn forgot_password(
    data: Json<EmailData>,
    db: &State<Database>,
    config: &State<Config>,
    mailer: &State<Mail>,
) -> Result<Json<MessageResponse>, Problem> {
    let email = validate::required("email", data.email.as_deref())?;
    let user = db
        .find_user_by_email(email)
        .await?
        .ok_or_else(user_problem::unknown_email)?;

    let (raw, token) = OneTimeToken::issue(RESET_LIFETIME_MINUTES);
    db.set_token(user.id, TokenKind::PasswordReset, &token)
        .await?;

    let link = config.api_link(&format!("auth/reset-password/{}", raw));
    mail::send_logged(
        mailer.inner().as_ref(),
        Email::password_reset(&user.email, &user.first_name, &link),
    )
    .await;

    Ok(Json(MessageResponse::new(
        "Password reset link sent to your email.",
    )))
}

/// Set a new password with the emailed reset token
#[utoipa::path(
    request_body = PasswordData,
    responses(
        (status = 200, body = MessageResponse),
        (status = 400, description = "Weak password or bad token", body = Problem),
    )
)]
#[patch("/auth/reset-password/<token>", format = "json", data = "<data>")]
#[tracing::instrument(skip(token, db))]
pub async fn reset_password(
    token: &str,
    data: Json<PasswordData>,
    db: &State<Database>,
) -> Result<Json<MessageResponse>, Problem> {
    let password = validate::required("password", data.password.as_deref())?;
    validate::password(password)?;

    let user = db
        .find_user_by_token(TokenKind::PasswordReset, token)
        .await?
        .ok_or_else(user_problem::bad_token)?;

    db.set_password(user.id, &PasswordHash::new(password)?)
        .await?;
    tracing::info!("password of user {} was reset", user.id);

    Ok(Json(MessageResponse::new("Password reset successfully.")))
}

/// Current user
#[utoipa::path(responses((status = 200, body = UserResponse)), security(("jwt" = [])))]
#[get("/auth/me")]
#[tracing::instrument(skip(db))]
pub async fn me(auth: UserRoleToken, db: &State<Database>) -> Result<Json<UserResponse>, Problem> {
    db.get_user(auth.user)
        .await?
        .map(|it| Json(it.into()))
        .ok_or_else(|| user_problem::not_found(auth.user))
}

/// Update the current user's name, email or phone number
#[utoipa::path(
    request_body = ProfileUpdateData,
    responses(
        (status = 200, body = UserResponse),
        (status = 400, description = "Invalid data or email in use", body = Problem),
    ),
    security(("jwt" = []))
)]
#[patch("/auth/profile", format = "json", data = "<update>")]
#[tracing::instrument(skip(db))]
pub async fn update_profile(
    update: Json<ProfileUpdateData>,
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<UserResponse>, Problem> {
    let set = update.to_update()?;
    if set.is_empty() {
        return Err(problems::bad_request("No fields to update."));
    }

    db.update_user(auth.user, set)
        .await?
        .map(|it| Json(it.into()))
        .ok_or_else(|| user_problem::not_found(auth.user))
}

/// Clear the auth cookie
#[utoipa::path(responses((status = 200, body = MessageResponse)))]
#[post("/auth/logout")]
pub async fn logout(cookies: &CookieJar<'_>) -> Json<MessageResponse> {
    cookies.remove(Cookie::from(AUTH_COOKIE_NAME));
    Json(MessageResponse::new("Logged out."))
}
