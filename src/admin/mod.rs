//! Admin HTTP surface: health, metrics and endpoint state

pub mod handlers;
pub mod models;
pub mod routes;

pub use routes::{AdminState, create_router};
