//! HTTP API
//!
//! Health, metrics, leaderboard and audit lookups, and the `/ws` upgrade
//! into the realtime gateway.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use handlers::AppState;
pub use server::ApiServer;
