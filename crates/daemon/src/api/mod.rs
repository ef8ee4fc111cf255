//! HTTP/JSON API.
//!
//! Exposes engine sessions and the recognition proxy over axum. Handlers share
//! one [`EngineService`](crate::service::EngineService) through router state.

pub mod error;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiJson, ApiResult};
pub use server::{router, ApiServer};
