pub mod admin_handlers;
pub mod app;
pub mod auth;
pub mod billing;
pub mod config;
pub mod error;
pub mod estimate;
pub mod handlers;
pub mod job_handlers;
pub mod jobs;
pub mod providers;
pub mod request;
pub mod selector;
pub mod streaming;
pub mod transform;
pub mod upstream;
pub mod users;
