use bson::{doc, Document};
use chrono::Utc;
use mongodb::Database;
use rocket::form::Form;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::State;
use uuid::Uuid;

use crate::config::Config;
use crate::data::content::db::problem as content_problem;
use crate::data::content::db::ContentDbExt;
use crate::data::content::query::{self, ContentQuery};
use crate::data::content::{Content, ContentForm, ContentResponse, ContentType};
use crate::middleware::paging::{ContentPage, PageState, Paginated};
use crate::resp::jwt::UserRoleToken;
use crate::resp::problem::{problems, Problem};
use crate::role::Role;
use crate::service::media::{Media, MediaStore, StoredFile, Upload};
use crate::service::notify::{Delivery, Notifier};

use super::MessageResponse;

const DEFAULT_PAGE_LENGTH: u32 = 10;

/// Removes a replaced or orphaned file. Failures only leave garbage on the media host.
async fn discard_file(media: &dyn MediaStore, file: &StoredFile) {
    if let Err(e) = media.delete(file).await {
        tracing::warn!("unable to delete media {}: {}", file.public_id, e);
    }
}

async fn upload_form_file(
    form: &ContentForm<'_>,
    media: &dyn MediaStore,
) -> Result<Option<StoredFile>, Problem> {
    match &form.file {
        Some(file) if form.has_file() => {
            let upload = Upload::from_temp_file(file).await?;
            Ok(Some(media.upload(upload).await?))
        }
        _ => Ok(None),
    }
}

/// Writes `update` to owned content. A file uploaded for it is removed again when
/// nothing was written.
async fn apply_update(
    db: &Database,
    media: &dyn MediaStore,
    id: Uuid,
    teacher: Uuid,
    update: Document,
    uploaded: Option<&StoredFile>,
) -> Result<Content, Problem> {
    let result = match db.update_content(id, teacher, update).await {
        Ok(Some(content)) => Ok(content),
        Ok(None) => Err(content_problem::not_found_or_unauthorized(id)),
        Err(e) => Err(e),
    };
    if result.is_err() {
        if let Some(file) = uploaded {
            discard_file(media, file).await;
        }
    }
    result
}

/// Create content (teacher)
///
/// Multipart form. Every content type except `text` needs a `file`.
#[utoipa::path(
    request_body(content_type = "multipart/form-data", content = ContentResponse),
    responses(
        (status = 201, body = ContentResponse),
        (status = 400, body = Problem),
        (status = 403, body = Problem),
        (status = 409, description = "Title already used by this teacher", body = Problem),
    ),
    security(("jwt" = []))
)]
#[post("/content", data = "<form>")]
#[tracing::instrument(skip(form, db, config, media, notifier))]
pub async fn content_create(
    form: Form<ContentForm<'_>>,
    auth: UserRoleToken,
    db: &State<Database>,
    config: &State<Config>,
    media: &State<Media>,
    notifier: &State<Notifier>,
) -> Result<(Status, Json<ContentResponse>), Problem> {
    auth.require(&[Role::Teacher])?;

    let new = form.validate_new(config)?;
    if let Some(existing) = db.find_duplicate_title(auth.user, &new.title, None).await? {
        return Err(content_problem::duplicate_title(existing.id));
    }

    let file = if new.content_type.needs_file() {
        upload_form_file(&form, media.inner().as_ref()).await?
    } else {
        None
    };

    let content = new.into_content(auth.user, file);
    if let Err(e) = db.insert_content(&content).await {
        if let Some(file) = &content.file {
            discard_file(media.inner().as_ref(), file).await;
        }
        return Err(e);
    }

    notifier.spawn(Delivery::new_content(&content));
    Ok((Status::Created, Json(content.into())))
}

async fn page_of(
    db: &Database,
    filter: Document,
    sort: Document,
    page: PageState,
) -> Result<Json<Paginated<ContentResponse>>, Problem> {
    let limit = page.limit_or(DEFAULT_PAGE_LENGTH);
    let total = db.count_content(filter.clone()).await?;
    let items = db
        .list_content(filter, sort, page.skip(limit), limit)
        .await?;

    Ok(Json(Paginated::new(
        items.into_iter().map(ContentResponse::from).collect(),
        page.info(limit, total),
    )))
}

/// Content visible to the current student
#[utoipa::path(
    params(
        ContentQuery,
        ("page" = Option<u32>, Query,),
        ("limit" = Option<u32>, Query,),
    ),
    responses((status = 200, body = ContentPage), (status = 403, body = Problem)),
    security(("jwt" = []))
)]
#[get("/content?<query..>")]
#[tracing::instrument(skip(db))]
pub async fn content_list(
    query: ContentQuery,
    page: PageState,
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<Paginated<ContentResponse>>, Problem> {
    auth.require(&[Role::Student])?;
    let filter = query.student_filter(auth.user, Utc::now())?;
    page_of(db, filter, query::newest_published(), page).await
}

/// The current teacher's content, drafts included
#[utoipa::path(
    params(
        ContentQuery,
        ("page" = Option<u32>, Query,),
        ("limit" = Option<u32>, Query,),
    ),
    responses((status = 200, body = ContentPage), (status = 403, body = Problem)),
    security(("jwt" = []))
)]
#[get("/content/mine?<query..>")]
#[tracing::instrument(skip(db))]
pub async fn content_mine(
    query: ContentQuery,
    page: PageState,
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<Paginated<ContentResponse>>, Problem> {
    auth.require(&[Role::Teacher])?;
    let filter = query.teacher_filter(auth.user)?;
    page_of(db, filter, query::newest_created(), page).await
}

/// Every content item (admin)
#[utoipa::path(
    params(
        ContentQuery,
        ("page" = Option<u32>, Query,),
        ("limit" = Option<u32>, Query,),
    ),
    responses((status = 200, body = ContentPage), (status = 403, body = Problem)),
    security(("jwt" = []))
)]
#[get("/content/all?<query..>")]
#[tracing::instrument(skip(db))]
pub async fn content_all(
    query: ContentQuery,
    page: PageState,
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<Paginated<ContentResponse>>, Problem> {
    auth.require_admin()?;
    let filter = query.admin_filter()?;
    page_of(db, filter, query::newest_created(), page).await
}

/// Content detail
///
/// Students only see content that is live and open to them. Anything else looks missing.
#[utoipa::path(
    responses(
        (status = 200, body = ContentResponse),
        (status = 403, body = Problem),
        (status = 404, body = Problem),
    ),
    security(("jwt" = []))
)]
#[get("/content/<id>")]
#[tracing::instrument(skip(db))]
pub async fn content_get(
    id: Uuid,
    auth: UserRoleToken,
    db: &State<Database>,
) -> Result<Json<ContentResponse>, Problem> {
    let content = db
        .get_content(id)
        .await?
        .ok_or_else(|| content_problem::not_found(id))?;

    match auth.role {
        Role::Admin => {}
        Role::Teacher if content.teacher == auth.user => {}
        Role::Student if content.is_visible_to(auth.user, Utc::now()) => {}
        Role::Student => return Err(content_problem::not_found(id)),
        _ => {
            return Err(problems::forbidden(
                "You don't have access to this content.",
            ))
        }
    }

    Ok(Json(content.into()))
}

/// Update own content (teacher)
///
/// Multipart form with the fields to change. A new `file` replaces the stored one;
/// switching to `text` drops it.
#[utoipa::path(
    request_body(content_type = "multipart/form-data", content = ContentResponse),
    responses(
        (status = 200, body = ContentResponse),
        (status = 400, body = Problem),
        (status = 404, description = "Missing or not owned", body = Problem),
        (status = 409, body = Problem),
    ),
    security(("jwt" = []))
)]
#[put("/content/<id>", data = "<form>")]
#[tracing::instrument(skip(form, db, config, media, notifier))]
pub async fn content_update(
    id: Uuid,
    form: Form<ContentForm<'_>>,
    auth: UserRoleToken,
    db: &State<Database>,
    config: &State<Config>,
    media: &State<Media>,
    notifier: &State<Notifier>,
) -> Result<Json<ContentResponse>, Problem> {
    auth.require(&[Role::Teacher])?;

    let existing = db
        .find_owned_content(id, auth.user)
        .await?
        .ok_or_else(|| content_problem::not_found_or_unauthorized(id))?;

    let mut set = form.validate_update(config)?;
    if let Ok(title) = set.get_str("title") {
        if let Some(other) = db.find_duplicate_title(auth.user, title, Some(id)).await? {
            return Err(content_problem::duplicate_title(other.id));
        }
    }

    let content_type = form.content_type.unwrap_or(existing.content_type);
    let mut update = Document::new();
    let mut replaced: Option<StoredFile> = None;
    let mut uploaded: Option<StoredFile> = None;

    if content_type == ContentType::Text {
        if existing.file.is_some() {
            update.insert("$unset", doc! { "file": "" });
            replaced = existing.file.clone();
        }
    } else if let Some(file) = upload_form_file(&form, media.inner().as_ref()).await? {
        replaced = existing.file.clone();
        uploaded = Some(file);
    } else if existing.file.is_none() {
        return Err(problems::invalid_field(
            "file",
            format!(
                "File is required for content type: {}",
                content_type.as_str()
            ),
        ));
    }

    if let Some(file) = &uploaded {
        match bson::to_bson(file) {
            Ok(it) => {
                set.insert("file", it);
            }
            Err(e) => {
                discard_file(media.inner().as_ref(), file).await;
                return Err(e.into());
            }
        }
    }
    if set.is_empty() && update.is_empty() {
        return Err(problems::bad_request("No fields to update."));
    }
    update.insert("$set", set);

    let updated = apply_update(
        db,
        media.inner().as_ref(),
        id,
        auth.user,
        update,
        uploaded.as_ref(),
    )
    .await?;

    if let Some(old) = replaced {
        discard_file(media.inner().as_ref(), &old).await;
    }

    notifier.spawn(Delivery::content_updated(&updated));
    Ok(Json(updated.into()))
}

/// Publish own content (teacher)
#[utoipa::path(
    responses(
        (status = 200, body = ContentResponse),
        (status = 400, description = "Already published", body = Problem),
        (status = 404, description = "Missing or not owned", body = Problem),
    ),
    security(("jwt" = []))
)]
#[put("/content/<id>/publish")]
#[tracing::instrument(skip(db, notifier))]
pub async fn content_publish(
    id: Uuid,
    auth: UserRoleToken,
    db: &State<Database>,
    notifier: &State<Notifier>,
) -> Result<Json<ContentResponse>, Problem> {
    auth.require(&[Role::Teacher])?;

    let existing = db
        .find_owned_content(id, auth.user)
        .await?
        .ok_or_else(|| content_problem::not_found_or_unauthorized(id))?;

    let already_published = || {
        problems::bad_request("Content is already published.")
            .insert(
                "published_at",
                existing.published_at.map(|it| it.to_chrono()),
            )
            .to_owned()
    };
    if existing.is_published {
        return Err(already_published());
    }

    // a concurrent publish wins the filter on is_published
    let content = db
        .publish_content(id, auth.user)
        .await?
        .ok_or_else(already_published)?;
    tracing::info!("teacher {} published content {}", auth.user, id);

    notifier.spawn(Delivery::new_content(&content));
    notifier.spawn(Delivery::content_published(&content));

    Ok(Json(content.into()))
}

/// Delete content (owner or admin)
#[utoipa::path(
    responses(
        (status = 200, body = MessageResponse),
        (status = 403, body = Problem),
        (status = 404, body = Problem),
    ),
    security(("jwt" = []))
)]
#[delete("/content/<id>")]
#[tracing::instrument(skip(db, media))]
pub async fn content_delete(
    id: Uuid,
    auth: UserRoleToken,
    db: &State<Database>,
    media: &State<Media>,
) -> Result<Json<MessageResponse>, Problem> {
    let content = db
        .get_content(id)
        .await?
        .ok_or_else(|| content_problem::not_found(id))?;

    let owner = auth.role == Role::Teacher && content.teacher == auth.user;
    if !owner && !auth.role.is_admin() {
        return Err(problems::forbidden(
            "Only the owner or an admin can delete content.",
        ));
    }

    db.delete_content(id)
        .await?
        .ok_or_else(|| content_problem::not_found(id))?;
    if let Some(file) = &content.file {
        discard_file(media.inner().as_ref(), file).await;
    }
    tracing::info!("user {} deleted content {}", auth.user, id);

    Ok(Json(MessageResponse::new("Content deleted successfully.")))
}

#[cfg(test)]
mod content_endpoints {
    use bson::doc;
    use rocket::http::{ContentType, Status};
    use rocket::local::asynchronous::Client;
    use uuid::Uuid;

    use crate::data::content::db::ContentDbExt;
    use crate::data::content::ContentResponse;
    use crate::role::Role;
    use crate::route::testing::{bearer, bearer_for, client, database, live_client};
    use crate::service::media::{LocalMediaStore, MediaStore, Upload};

    use super::apply_update;

    const LESSON: &str = "title=Fractions&description=Basics&subject=math&grade=5&content_type=text";

    async fn created(client: &Client, teacher: Uuid, body: &str) -> ContentResponse {
        let response = client
            .post("/api/v1/content")
            .header(ContentType::Form)
            .header(bearer_for(client, teacher, Role::Teacher))
            .body(body)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);
        response.into_json().await.expect("content body")
    }

    fn scratch_store() -> (std::path::PathBuf, LocalMediaStore) {
        let root = std::env::temp_dir().join(format!("eduportal-media-{}", Uuid::new_v4()));
        let store = LocalMediaStore::new(root.clone(), "/media");
        (root, store)
    }

    #[rocket::async_test]
    async fn only_teachers_create_content() {
        let client = client().await;
        for role in [Role::Student, Role::Parent, Role::Admin] {
            let response = client
                .post("/api/v1/content")
                .header(ContentType::Form)
                .header(bearer(&client, role))
                .body("title=Fractions")
                .dispatch()
                .await;
            assert_eq!(response.status(), Status::Forbidden, "{}", role);
        }
    }

    #[rocket::async_test]
    async fn creation_validates_required_fields() {
        let client = client().await;
        let response = client
            .post("/api/v1/content")
            .header(ContentType::Form)
            .header(bearer(&client, Role::Teacher))
            .body("title=Fractions&subject=math&grade=5&content_type=text")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
    }

    #[rocket::async_test]
    async fn unknown_subjects_are_rejected() {
        let client = client().await;
        let response = client
            .post("/api/v1/content")
            .header(ContentType::Form)
            .header(bearer(&client, Role::Teacher))
            .body("title=Fractions&description=Basics&subject=alchemy&grade=5&content_type=text")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
    }

    #[rocket::async_test]
    async fn file_types_need_a_file() {
        let client = client().await;
        let response = client
            .post("/api/v1/content")
            .header(ContentType::Form)
            .header(bearer(&client, Role::Teacher))
            .body("title=Fractions&description=Basics&subject=math&grade=5&content_type=pdf")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
    }

    #[rocket::async_test]
    async fn listings_are_role_scoped() {
        let client = client().await;
        let cases = [
            ("/api/v1/content", Role::Teacher),
            ("/api/v1/content/mine", Role::Student),
            ("/api/v1/content/all", Role::Teacher),
        ];
        for (uri, role) in cases {
            let response = client.get(uri).header(bearer(&client, role)).dispatch().await;
            assert_eq!(response.status(), Status::Forbidden, "{} as {}", uri, role);
        }
    }

    #[rocket::async_test]
    async fn out_of_range_grade_filter_is_rejected() {
        let client = client().await;
        let response = client
            .get("/api/v1/content?grade=14")
            .header(bearer(&client, Role::Student))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
    }

    #[rocket::async_test]
    async fn publishing_requires_a_teacher() {
        let client = client().await;
        let response = client
            .put(format!("/api/v1/content/{}/publish", Uuid::new_v4()))
            .header(bearer(&client, Role::Student))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);
    }

    #[rocket::async_test]
    async fn failed_update_drops_the_new_upload() {
        let client = client().await;
        let (root, store) = scratch_store();
        let upload = Upload::new("pdf", None, b"lesson".to_vec()).unwrap();
        let stored = store.upload(upload).await.unwrap();
        assert!(root.join(&stored.public_id).exists());

        let result = apply_update(
            database(&client),
            &store,
            Uuid::new_v4(),
            Uuid::new_v4(),
            doc! { "$set": { "title": "Decimals" } },
            Some(&stored),
        )
        .await;

        assert!(result.is_err());
        assert!(!root.join(&stored.public_id).exists());
        let _ = std::fs::remove_dir_all(root);
    }

    #[rocket::async_test]
    #[ignore = "needs a running MongoDB"]
    async fn update_of_vanished_content_drops_the_new_upload() {
        let client = live_client().await;
        let teacher = Uuid::new_v4();
        let content = created(&client, teacher, LESSON).await;
        database(&client).delete_content(content.id).await.unwrap();

        let (root, store) = scratch_store();
        let upload = Upload::new("pdf", None, b"lesson".to_vec()).unwrap();
        let stored = store.upload(upload).await.unwrap();

        let err = apply_update(
            database(&client),
            &store,
            content.id,
            teacher,
            doc! { "$set": { "title": "Decimals" } },
            Some(&stored),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status, Status::NotFound);
        assert!(!root.join(&stored.public_id).exists());
        let _ = std::fs::remove_dir_all(root);
    }

    #[rocket::async_test]
    #[ignore = "needs a running MongoDB"]
    async fn publishing_foreign_content_is_not_found() {
        let client = live_client().await;
        let content = created(&client, Uuid::new_v4(), LESSON).await;
        assert!(!content.is_published);

        let response = client
            .put(format!("/api/v1/content/{}/publish", content.id))
            .header(bearer(&client, Role::Teacher))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::NotFound);

        let stored = database(&client)
            .get_content(content.id)
            .await
            .unwrap()
            .expect("still stored");
        assert!(!stored.is_published);
    }

    #[rocket::async_test]
    #[ignore = "needs a running MongoDB"]
    async fn duplicate_titles_conflict_per_teacher() {
        let client = live_client().await;
        let teacher = Uuid::new_v4();
        let first = created(&client, teacher, LESSON).await;

        let response = client
            .post("/api/v1/content")
            .header(ContentType::Form)
            .header(bearer_for(&client, teacher, Role::Teacher))
            .body(LESSON)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Conflict);
        let body: serde_json::Value = response.into_json().await.expect("problem body");
        assert_eq!(body["existing_content_id"], first.id.to_string());

        // another teacher may reuse it
        created(&client, Uuid::new_v4(), LESSON).await;
    }
}
