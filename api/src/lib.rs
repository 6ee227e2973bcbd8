//! HTTP surface of the tally billing service

pub mod error;
pub mod routes;

pub use routes::{build_router, AppState};
