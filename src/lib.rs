//! Label catalog sync: pulls a label's albums from the Spotify catalog into
//! PostgreSQL and keeps release label assignments consistent.

pub mod catalog;
pub mod config;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod sync;
pub mod writer;
