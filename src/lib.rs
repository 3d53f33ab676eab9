pub mod client_key;
pub mod config;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod store;
