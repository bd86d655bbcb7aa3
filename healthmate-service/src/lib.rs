pub mod ai;
pub mod auth;
pub mod files;
pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod service;
pub mod store;

pub use models::*;
pub use pipeline::AnalysisPipeline;
pub use service::{AppState, create_app};
