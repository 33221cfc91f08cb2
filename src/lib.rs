pub mod auth;
pub mod compactor;
pub mod config;
pub mod driver;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;
