pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod webhooks;

pub use routes::{api_routes, app, AppServices};
