use mongodb::Database;
use rocket::response::stream::{Event, EventStream};
use rocket::tokio::select;
use rocket::{Shutdown, State};
use uuid::Uuid;

use crate::data::user::db::problem as user_problem;
use crate::data::user::db::UserDbExt;
use crate::resp::jwt::UserRoleToken;
use crate::resp::problem::{problems, Problem};
use crate::role::Role;
use crate::service::notify::{Notifier, Room, NOTIFICATION_EVENT};

/// Parses the comma separated `rooms` value.
pub fn requested_rooms(raw: Option<&str>) -> Result<Vec<Room>, Problem> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|it| !it.is_empty())
        .map(|name| {
            Room::parse(name).ok_or_else(|| {
                problems::invalid_field("rooms", format!("Unknown room: {}", name))
            })
        })
        .collect()
}

/// Personal and role rooms of other accounts can't be joined. `role` is the stored
/// one, tokens may predate a role change.
pub fn authorize_rooms(rooms: &[Room], user: Uuid, role: Role) -> Result<(), Problem> {
    for room in rooms {
        match room {
            Room::User(other) if *other != user => {
                return Err(problems::forbidden("Cannot join another user's room."))
            }
            Room::Role(other) if *other != role => {
                return Err(problems::forbidden("Cannot join another role's room."))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Live notifications
///
/// Server-sent events named `notification`. The personal, role and (for students)
/// grade rooms are always joined; `rooms` adds grade and subject rooms such as
/// `grade-5,subject-math`.
#[utoipa::path(
    params(("rooms" = Option<String>, Query, description = "Comma separated room names")),
    responses(
        (status = 200, content_type = "text/event-stream", description = "Notification stream"),
        (status = 400, body = Problem),
        (status = 403, body = Problem),
    ),
    security(("jwt" = []))
)]
#[get("/events?<rooms>")]
pub async fn event_stream(
    rooms: Option<String>,
    auth: UserRoleToken,
    db: &State<Database>,
    notifier: &State<Notifier>,
    mut shutdown: Shutdown,
) -> Result<EventStream![], Problem> {
    let extra = requested_rooms(rooms.as_deref())?;

    let user = db
        .get_user(auth.user)
        .await?
        .ok_or_else(|| user_problem::not_found(auth.user))?;
    authorize_rooms(&extra, user.id, user.role)?;
    let mut joined = Room::standing(user.id, user.role, user.profile.grade());
    joined.extend(extra);

    let mut subscription = notifier.hub().subscribe(joined);
    tracing::info!("user {} joined rooms {:?}", auth.user, subscription.rooms());
    let joined_names = subscription.rooms().to_vec();

    Ok(EventStream! {
        yield Event::json(&joined_names).event("connected");
        loop {
            let notification = select! {
                next = subscription.next() => match next {
                    Some(it) => it,
                    None => break,
                },
                _ = &mut shutdown => break,
            };
            yield Event::json(&*notification)
                .event(NOTIFICATION_EVENT)
                .id(notification.id.to_string());
        }
    })
}


#[cfg(test)]
mod event_endpoints {
    use rocket::http::Status;

    use crate::role::Role;
    use crate::route::testing::{
        bearer, bearer_for, client, live_client, stored_user, student_profile,
    };

    #[rocket::async_test]
    async fn malformed_rooms_are_refused() {
        let client = client().await;
        let response = client
            .get("/api/v1/events?rooms=grade-0")
            .header(bearer(&client, Role::Student))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
    }

    #[rocket::async_test]
    #[ignore = "needs a running MongoDB"]
    async fn role_rooms_follow_the_stored_role() {
        let client = live_client().await;
        let student = stored_user(&client, student_profile(5)).await;

        // token issued while the account was still a teacher
        let response = client
            .get("/api/v1/events?rooms=role-teacher")
            .header(bearer_for(&client, student.id, Role::Teacher))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        let response = client
            .get("/api/v1/events?rooms=role-admin")
            .header(bearer_for(&client, student.id, Role::Student))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);
    }
}
