//! Client-side cache for the cafe service: avatars, chat history and notices.

pub mod cache;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod notices;
pub mod service;

pub use client::ApiClient;
pub use error::{CacheError, Result};
pub use service::CacheService;
