use mongodb::Database;
use rocket::serde::json::Json;
use rocket::State;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::data::user::db::problem as user_problem;
use crate::data::user::db::{AdminUserUpdate, UserDbExt};
use crate::data::user::{filter, UserResponse};
use crate::middleware::paging::{PageState, Paginated, UserPage};
use crate::resp::jwt::UserRoleToken;
use crate::resp::problem::{problems, Problem};
use crate::role::Role;

use super::MessageResponse;

const DEFAULT_PAGE_LENGTH: u32 = 10;

#[derive(Debug, Clone, Default, FromForm, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UserQuery {
    pub role: Option<Role>,
    pub two_factor: Option<bool>,
    /// Matches names and email.
    pub search: Option<String>,
}

/// List users (admin)
#[utoipa::path(
    params(
        UserQuery,
        ("page" = Option<u32>, Query, description = "1-based page"),
        ("limit" = Option<u32>, Query, description = "Page length"),
    ),
    responses(
        (status = 200, body = UserPage),
        (status = 403, body = Problem),
    ),
    security(("jwt" = []))
)]
#[get("/users?<query..>")]
#[tracing::instrument(skip(db))]
pub async fn user_list(
    query: UserQuery,
    page: PageState,
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<Paginated<UserResponse>>, Problem> {
    auth.require_admin()?;

    let filter = filter::listing(query.role, query.two_factor, query.search.as_deref());
    let limit = page.limit_or(DEFAULT_PAGE_LENGTH);

    let total = db.count_users(filter.clone()).await?;
    let users = db.list_users(filter, page.skip(limit), limit).await?;

    Ok(Json(Paginated::new(
        users.into_iter().map(UserResponse::from).collect(),
        page.info(limit, total),
    )))
}

/// Get a user (admin)
#[utoipa::path(
    responses(
        (status = 200, body = UserResponse),
        (status = 403, body = Problem),
        (status = 404, body = Problem),
    ),
    security(("jwt" = []))
)]
#[get("/users/<id>")]
#[tracing::instrument(skip(db))]
pub async fn user_get(
    id: Uuid,
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<UserResponse>, Problem> {
    auth.require_admin()?;

    db.get_user(id)
        .await?
        .map(|it| Json(it.into()))
        .ok_or_else(|| user_problem::not_found(id))
}

/// Update any user's account fields (admin)
#[utoipa::path(
    request_body = AdminUserUpdate,
    responses(
        (status = 200, body = UserResponse),
        (status = 400, body = Problem),
        (status = 403, body = Problem),
        (status = 404, body = Problem),
    ),
    security(("jwt" = []))
)]
#[put("/users/<id>", format = "json", data = "<update>")]
#[tracing::instrument(skip(db))]
pub async fn user_update(
    id: Uuid,
    update: Json<AdminUserUpdate>,
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<UserResponse>, Problem> {
    auth.require_admin()?;

    if update.is_empty() {
        return Err(problems::bad_request("No fields to update."));
    }

    let current = db
        .get_user(id)
        .await?
        .ok_or_else(|| user_problem::not_found(id))?;
    let set = update.to_update(&current.profile)?;
    if set.is_empty() {
        return Err(problems::bad_request("No fields to update."));
    }

    let user = db
        .update_user(id, set)
        .await?
        .ok_or_else(|| user_problem::not_found(id))?;
    tracing::info!("admin {} updated user {}", auth.user, id);

    Ok(Json(user.into()))
}

/// Delete a user (admin)
#[utoipa::path(
    responses(
        (status = 200, body = MessageResponse),
        (status = 400, description = "Deleting yourself", body = Problem),
        (status = 403, body = Problem),
        (status = 404, body = Problem),
    ),
    security(("jwt" = []))
)]
#[delete("/users/<id>")]
#[tracing::instrument(skip(db))]
pub async fn user_delete(
    id: Uuid,
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<MessageResponse>, Problem> {
    auth.require_admin()?;

    if auth.user == id {
        return Err(problems::bad_request(
            "You cannot delete your own account this way.",
        ));
    }

    let removed = db
        .delete_user(id)
        .await?
        .ok_or_else(|| user_problem::not_found(id))?;
    tracing::info!("admin {} deleted user {}", auth.user, removed.id);

    Ok(Json(MessageResponse::new("User deleted successfully.")))
}

#[cfg(test)]
mod user_endpoints {
    use rocket::http::{ContentType, Status};
    use uuid::Uuid;

    use crate::data::user::db::{problem as user_problem, UserDbExt};
    use crate::data::user::{PasswordHash, UserResponse};
    use crate::role::Role;
    use crate::route::testing::{
        bearer, bearer_for, client, database, live_client, stored_user, student_profile,
        teacher_profile,
    };

    #[rocket::async_test]
    async fn listing_is_admin_only() {
        let client = client().await;

        let anonymous = client.get("/api/v1/users").dispatch().await;
        assert_eq!(anonymous.status(), Status::Unauthorized);

        for role in [Role::Student, Role::Teacher, Role::Parent] {
            let response = client
                .get("/api/v1/users?page=1&role=student")
                .header(bearer(&client, role))
                .dispatch()
                .await;
            assert_eq!(response.status(), Status::Forbidden, "{}", role);
        }
    }

    #[rocket::async_test]
    async fn admins_cannot_delete_themselves() {
        let client = client().await;
        let admin = Uuid::new_v4();
        let response = client
            .delete(format!("/api/v1/users/{}", admin))
            .header(bearer_for(&client, admin, Role::Admin))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
    }

    #[rocket::async_test]
    async fn empty_admin_update_is_rejected() {
        let client = client().await;
        let response = client
            .put(format!("/api/v1/users/{}", Uuid::new_v4()))
            .header(ContentType::JSON)
            .header(bearer(&client, Role::Admin))
            .body("{}")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
    }

    #[rocket::async_test]
    #[ignore = "needs a running MongoDB"]
    async fn role_change_replaces_the_profile() {
        let client = live_client().await;
        let teacher = stored_user(&client, teacher_profile()).await;
        let uri = format!("/api/v1/users/{}", teacher.id);

        let missing_grade = client
            .put(uri.as_str())
            .header(ContentType::JSON)
            .header(bearer(&client, Role::Admin))
            .body(r#"{"role":"student"}"#)
            .dispatch()
            .await;
        assert_eq!(missing_grade.status(), Status::BadRequest);

        let response = client
            .put(uri.as_str())
            .header(ContentType::JSON)
            .header(bearer(&client, Role::Admin))
            .body(r#"{"role":"student","grade":6}"#)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let updated: UserResponse = response.into_json().await.expect("user body");
        assert_eq!(updated.role, Role::Student);
        assert_eq!(updated.profile.role(), Role::Student);
        assert_eq!(updated.profile.grade(), Some(6));

        let stored = database(&client)
            .get_user(teacher.id)
            .await
            .unwrap()
            .expect("still stored");
        assert_eq!(stored.role, stored.profile.role());
    }

    #[rocket::async_test]
    #[ignore = "needs a running MongoDB"]
    async fn racing_signups_with_one_email_store_one_user() {
        let client = live_client().await;
        let db = database(&client);
        let account = || {
            crate::data::user::User::new(
                "race@example.com",
                "Race",
                "Condition",
                "5550102030",
                PasswordHash::new("Str0ng!pass").unwrap(),
                teacher_profile(),
            )
        };
        let (a, b) = (account(), account());

        let (first, second) = rocket::tokio::join!(db.create_user(&a), db.create_user(&b));
        let refused = match (first, second) {
            (Ok(()), Err(e)) | (Err(e), Ok(())) => e,
            other => panic!("expected exactly one stored user, got {:?}", other),
        };
        assert_eq!(refused, user_problem::email_taken("race@example.com"));
    }

    #[rocket::async_test]
    #[ignore = "needs a running MongoDB"]
    async fn admin_cannot_reuse_another_email() {
        let client = live_client().await;
        let first = stored_user(&client, student_profile(4)).await;
        let second = stored_user(&client, student_profile(4)).await;

        let response = client
            .put(format!("/api/v1/users/{}", second.id))
            .header(ContentType::JSON)
            .header(bearer(&client, Role::Admin))
            .body(format!(r#"{{"email":"{}"}}"#, first.email))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
    }
}
