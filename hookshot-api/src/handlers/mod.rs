mod admin;
mod app;
mod webhook;

pub use app::{add_routes, AppState};
