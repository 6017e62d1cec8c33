use mongodb::Database;
use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::data::notification::db::problem as notification_problem;
use crate::data::notification::db::{NotificationDbExt, NOTIFICATION_PAGE_SIZE};
use crate::data::notification::NotificationResponse;
use crate::data::user::db::problem as user_problem;
use crate::data::user::db::UserDbExt;
use crate::middleware::paging::{NotificationPage, PageState, Paginated};
use crate::resp::jwt::UserRoleToken;
use crate::resp::problem::Problem;
use crate::service::notify::Room;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReadAllResponse {
    pub message: String,
    pub updated: u64,
}

/// Room names whose broadcasts the caller reads, from the stored account.
async fn reader_rooms(db: &Database, auth: &UserRoleToken) -> Result<Vec<String>, Problem> {
    let user = db
        .get_user(auth.user)
        .await?
        .ok_or_else(|| user_problem::not_found(auth.user))?;
    Ok(Room::names(&Room::standing(
        user.id,
        user.role,
        user.profile.grade(),
    )))
}

/// Notifications for the current user, newest first
#[utoipa::path(
    params(("page" = Option<u32>, Query, description = "1-based page of six")),
    responses((status = 200, body = NotificationPage), (status = 401, body = Problem)),
    security(("jwt" = []))
)]
#[get("/notifications?<page>")]
#[tracing::instrument(skip(db))]
pub async fn notification_list(
    page: Option<u32>,
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<Paginated<NotificationResponse>>, Problem> {
    let rooms = reader_rooms(db, &auth).await?;
    let page = PageState::new(page.unwrap_or(1), NOTIFICATION_PAGE_SIZE);

    let total = db.count_notifications(auth.user, &rooms).await?;
    let items = db
        .list_notifications(auth.user, &rooms, page.skip(NOTIFICATION_PAGE_SIZE))
        .await?;

    Ok(Json(Paginated::new(
        items
            .into_iter()
            .map(|it| it.into_response(auth.user))
            .collect(),
        page.info(NOTIFICATION_PAGE_SIZE, total),
    )))
}

/// Mark one notification as read
#[utoipa::path(
    responses((status = 200, body = NotificationResponse), (status = 404, body = Problem)),
    security(("jwt" = []))
)]
#[put("/notifications/<id>/read")]
#[tracing::instrument(skip(db))]
pub async fn notification_read(
    id: Uuid,
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<NotificationResponse>, Problem> {
    let rooms = reader_rooms(db, &auth).await?;
    db.mark_read(id, auth.user, &rooms)
        .await?
        .map(|it| Json(it.into_response(auth.user)))
        .ok_or_else(|| notification_problem::not_found(id))
}

/// Mark every visible notification as read
#[utoipa::path(
    responses((status = 200, body = ReadAllResponse)),
    security(("jwt" = []))
)]
#[put("/notifications/read-all")]
#[tracing::instrument(skip(db))]
pub async fn notification_read_all(
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<ReadAllResponse>, Problem> {
    let rooms = reader_rooms(db, &auth).await?;
    let updated = db.mark_all_read(auth.user, &rooms).await?;
    tracing::debug!("user {} marked {} notifications read", auth.user, updated);

    Ok(Json(ReadAllResponse {
        message: "All notifications marked as read.".to_string(),
        updated,
    }))
}
