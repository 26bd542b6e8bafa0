pub mod auth;
pub mod records;
