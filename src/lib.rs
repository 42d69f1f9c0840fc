pub mod aggregate;
pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod http;
pub mod identity;
pub mod metadata;
pub mod output;
pub mod pacing;
pub mod reviews;
pub mod store;
pub mod tui;
