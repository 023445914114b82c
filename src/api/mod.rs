//! API endpoint handlers module

pub mod admin;
pub mod dispatch;
pub mod health;
