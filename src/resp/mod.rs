pub mod catchers;
pub mod jwt;
pub mod problem;
