use std::collections::BTreeMap;

use rocket::{Build, Rocket, Route};
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

pub mod auth;
pub mod comments;
pub mod content;
pub mod events;
pub mod files;
pub mod notifications;
pub mod users;

use auth::*;
use comments::*;
use content::*;
use events::*;
use files::*;
use notifications::*;
use users::*;

use crate::{
    data::{
        content as cd,
        notification::{NotificationDraft, NotificationKind, NotificationResponse},
        user::db::{
            AdminUserUpdate, EmailData, LoginData, PasswordData, ProfileUpdateData, SignupData,
            TwoFactorData,
        },
        user::{ParentProfile, Profile, Relationship, StudentProfile, TeacherProfile, UserResponse},
    },
    middleware::paging::{ContentPage, NotificationPage, PageInfo, UserPage},
    resp::{jwt::doc::JWTAuth, problem::Problem},
    role::Role,
    service::media::{ResourceType, StoredFile},
};

/// Plain acknowledgement body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl ToString) -> MessageResponse {
        MessageResponse {
            message: message.to_string(),
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        signup,
        verify_email,
        resend_verification,
        login,
        verify_two_factor,
        enable_two_factor,
        disable_two_factor,
        forgot_password,
        reset_password,
        me,
        update_profile,
        logout,
        user_list,
        user_get,
        user_update,
        user_delete,
        content_create,
        content_list,
        content_mine,
        content_all,
        content_get,
        content_update,
        content_publish,
        content_delete,
        comment_create,
        comment_reply,
        notification_list,
        notification_read,
        notification_read_all,
        event_stream
    ),
    components(schemas(
        Role,
        UserResponse,
        Profile,
        StudentProfile,
        TeacherProfile,
        ParentProfile,
        Relationship,
        SignupData,
        LoginData,
        TwoFactorData,
        EmailData,
        PasswordData,
        ProfileUpdateData,
        AdminUserUpdate,
        SignupResponse,
        AuthResponse,
        TwoFactorPending,
        MessageResponse,
        cd::ContentResponse,
        cd::ContentKind,
        cd::ContentType,
        cd::Access,
        cd::CommentSettings,
        cd::CommentResponse,
        cd::ReplyResponse,
        CommentData,
        StoredFile,
        ResourceType,
        NotificationKind,
        NotificationDraft,
        NotificationResponse,
        ReadAllResponse,
        PageInfo,
        UserPage,
        ContentPage,
        NotificationPage,
        Problem
    )),
    modifiers(&JWTAuth, &V1_PREFIX)
)]
pub struct ApiDocV1;

pub struct PathPrefix(pub &'static str);
static V1_PREFIX: PathPrefix = PathPrefix("/api/v1");

impl utoipa::Modify for PathPrefix {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let mut new_paths = BTreeMap::new();

        for (path, item) in std::mem::take(&mut openapi.paths.paths) {
            new_paths.insert(self.0.to_string() + path.as_ref(), item);
        }

        openapi.paths.paths = new_paths;
    }
}

pub fn api_v1() -> Vec<Route> {
    routes![
        signup,
        verify_email,
        resend_verification,
        login,
        verify_two_factor,
        enable_two_factor,
        disable_two_factor,
        forgot_password,
        reset_password,
        me,
        update_profile,
        logout,
        user_list,
        user_get,
        user_update,
        user_delete,
        content_create,
        content_list,
        content_mine,
        content_all,
        content_get,
        content_update,
        content_publish,
        content_delete,
        comment_create,
        comment_reply,
        notification_list,
        notification_read,
        notification_read_all,
        event_stream
    ]
}

pub fn mount_api(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket
        .mount("/api/v1", api_v1())
        .mount(
            "/",
            SwaggerUi::new("/swagger/<_..>").url("/api/v1/openapi.json", ApiDocV1::openapi()),
        )
        .mount("/", routes![media_file])
}
