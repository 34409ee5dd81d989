pub mod app;
pub mod assignment;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod generator;
pub mod knowledge;
pub mod pending;
pub mod pg_store;
pub mod polling;
pub mod prompting;
pub mod realtime;
pub mod service;
pub mod store;
pub mod types;

pub use error::{HelpdeskError, Result};
