pub mod content;
pub mod notification;
pub mod user;
pub mod validate;
