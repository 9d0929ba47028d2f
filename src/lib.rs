pub mod app;
pub mod assembler;
pub mod auth;
pub mod backends;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod openai;
pub mod upstream;
pub mod usage;
