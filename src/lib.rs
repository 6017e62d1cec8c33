#[macro_use]
extern crate rocket;
#[macro_use]
extern crate serde;

use std::sync::Arc;

use mongodb::Database;
use rocket::data::{ByteUnit, Limits};
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedHeaders, AllowedOrigins};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::error::{BackendError, ConfigurationError};
use crate::resp::problem;
use crate::route::mount_api;
use crate::security::Security;
use crate::service::mail::{self, Mail};
use crate::service::media::{self, Media};
use crate::service::notify::{Notifier, RoomHub};

pub mod config;
pub mod data;
pub mod db;
pub mod error;
pub mod middleware;
pub mod resp;
pub mod role;
pub mod route;
pub mod security;
pub mod service;
pub mod util;

/// Multipart overhead allowed on top of the uploaded file itself.
const FORM_FIELDS_ALLOWANCE: u64 = 1024 * 1024;

pub async fn create(log_level: Option<Level>) -> Result<Rocket<Build>, BackendError> {
    if let Some(l) = log_level {
        let subscriber = FmtSubscriber::builder().with_max_level(l).finish();

        if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Unable to set global logger: {}", err);
        };
        if let Err(err) = tracing_log::LogTracer::init() {
            eprintln!("Unable to forward log records: {}", err);
        }
    }

    tracing::info!("Reading .env file...");
    if dotenv::dotenv().is_err() {
        tracing::warn!("Unable to load .env file.");
    }

    tracing::info!("Loading configuration...");
    let c = match Config::load() {
        Ok(c) => {
            tracing::info!("Configuration loaded.");
            c
        }
        Err(ConfigurationError::NotFound(_)) => {
            let c = Config::default();
            if c.save().is_err() {
                tracing::warn!("Unable to save generated configuration.");
            }
            c
        }
        Err(other) => {
            tracing::error!("Configuration error: {}", other);
            return Err(other.into());
        }
    };
    problem::expose_internal_details(c.expose_error_details());

    tracing::info!("Loading security information...");
    let security = Security::load(&c)?;

    tracing::info!("Connecting to MongoDB: {}", c.mongodb_db);
    let db = db::connect_with_retry(&c).await?;
    if let Err(e) = db::ensure_indexes(&db).await {
        tracing::warn!("Unable to create MongoDB indexes: {}", e);
    }

    let mail = mail::from_config(&c)?;
    let media = media::from_config(&c);

    build(c, db, security, mail, media)
}

/// Assembles the server from already initialized collaborators.
pub fn build(
    c: Config,
    db: Database,
    security: Security,
    mail: Mail,
    media: Media,
) -> Result<Rocket<Build>, BackendError> {
    let upload_limit = ByteUnit::from(c.max_upload_bytes());
    let limits = Limits::default()
        .limit("file", upload_limit)
        .limit("data-form", upload_limit + ByteUnit::from(FORM_FIELDS_ALLOWANCE));
    let figment = rocket::Config::figment().merge(("limits", limits));

    let notifier = Notifier::new(
        RoomHub::new(c.realtime_capacity),
        Arc::new(db.clone()),
    );

    tracing::info!("Starting HTTP server...");
    let mut r = rocket::custom(figment)
        .manage(c)
        .manage(db)
        .manage(security)
        .manage(mail)
        .manage(media)
        .manage(notifier)
        .register("/", resp::catchers::catchers());

    tracing::info!("Setting up CORS...");
    let allowed_origins = AllowedOrigins::All;

    let cors = rocket_cors::CorsOptions {
        allowed_origins,
        allowed_methods: vec![
            Method::Get,
            Method::Put,
            Method::Post,
            Method::Patch,
            Method::Delete,
        ]
        .into_iter()
        .map(From::from)
        .collect(),
        allowed_headers: AllowedHeaders::All,
        allow_credentials: true,
        ..Default::default()
    }
    .to_cors()?;

    r = r.attach(cors);
    r = mount_api(r);

    Ok(r)
}
