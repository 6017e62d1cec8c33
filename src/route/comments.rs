use chrono::Utc;
use mongodb::Database;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::data::content::db::problem as content_problem;
use crate::data::content::db::ContentDbExt;
use crate::data::content::{comment_text, Comment, CommentResponse, Content, Reply, ReplyResponse};
use crate::data::user::db::problem as user_problem;
use crate::data::user::db::UserDbExt;
use crate::resp::jwt::UserRoleToken;
use crate::resp::problem::{problems, Problem};
use crate::role::Role;
use crate::service::notify::{Delivery, Notifier};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CommentData {
    pub text: String,
}

/// Loads content the caller may discuss and checks its comment settings.
async fn discussable(db: &Database, id: Uuid, auth: &UserRoleToken) -> Result<Content, Problem> {
    if !auth.role.can_comment() {
        return Err(problems::forbidden(
            "Only teachers and students can comment.",
        ));
    }

    let content = db
        .get_content(id)
        .await?
        .ok_or_else(|| content_problem::not_found(id))?;

    let reachable = match auth.role {
        Role::Student => content.is_visible_to(auth.user, Utc::now()),
        _ => content.teacher == auth.user || content.is_live(Utc::now()),
    };
    if !reachable {
        return Err(content_problem::not_found(id));
    }

    content.comment_settings.check(auth.role)?;
    Ok(content)
}

async fn author_name(db: &Database, auth: &UserRoleToken) -> Result<String, Problem> {
    db.get_user(auth.user)
        .await?
        .map(|it| it.full_name())
        .ok_or_else(|| user_problem::not_found(auth.user))
}

/// Comment on content
///
/// Notifies the owning teacher unless they wrote the comment.
#[utoipa::path(
    request_body = CommentData,
    responses(
        (status = 201, body = CommentResponse),
        (status = 400, body = Problem),
        (status = 403, description = "Role may not comment or comments are closed", body = Problem),
        (status = 404, body = Problem),
    ),
    security(("jwt" = []))
)]
#[post("/content/<id>/comments", format = "json", data = "<data>")]
#[tracing::instrument(skip(db, notifier))]
pub async fn comment_create(
    id: Uuid,
    data: Json<CommentData>,
    auth: UserRoleToken,
    db: &State<Database>,
    notifier: &State<Notifier>,
) -> Result<(Status, Json<CommentResponse>), Problem> {
    let text = comment_text(&data.text)?;
    let content = discussable(db, id, &auth).await?;
    let author = author_name(db, &auth).await?;

    let comment = Comment::new(auth.user, auth.role, author, text);
    db.push_comment(id, &comment).await?;

    if content.teacher != auth.user {
        notifier.spawn(Delivery::new_comment(
            &content,
            &comment.author_name,
            &comment.text,
        ));
    }

    Ok((Status::Created, Json(comment.into())))
}

/// Reply to a comment
///
/// Notifies the comment's author unless they wrote the reply.
#[utoipa::path(
    request_body = CommentData,
    responses(
        (status = 201, body = ReplyResponse),
        (status = 400, body = Problem),
        (status = 403, body = Problem),
        (status = 404, description = "Content or comment missing", body = Problem),
    ),
    security(("jwt" = []))
)]
#[post(
    "/content/<id>/comments/<comment_id>/replies",
    format = "json",
    data = "<data>"
)]
#[tracing::instrument(skip(db, notifier))]
pub async fn comment_reply(
    id: Uuid,
    comment_id: Uuid,
    data: Json<CommentData>,
    auth: UserRoleToken,
    db: &State<Database>,
    notifier: &State<Notifier>,
) -> Result<(Status, Json<ReplyResponse>), Problem> {
    let text = comment_text(&data.text)?;
    let content = discussable(db, id, &auth).await?;
    let comment = content
        .comment(comment_id)
        .ok_or_else(|| content_problem::comment_not_found(comment_id))?;
    let author = author_name(db, &auth).await?;

    let reply = Reply::new(auth.user, auth.role, author, text);
    db.push_reply(id, comment_id, &reply).await?;

    if comment.user != auth.user {
        notifier.spawn(Delivery::comment_reply(
            &content,
            comment,
            &reply.author_name,
            &reply.text,
        ));
    }

    Ok((Status::Created, Json(reply.into())))
}
