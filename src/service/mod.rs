pub mod mail;
pub mod media;
pub mod notify;
