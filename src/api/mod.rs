//! API Module
//!
//! HTTP endpoints for cluster registration, config push/pull, and
//! master→slave sync.

mod http;

pub use http::{
    router, serve, AppState, PullRequest, PullResponse, RegisterRequest,
};
