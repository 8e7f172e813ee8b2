//! Web server module exposing the producer over HTTP.
//!
//! This module provides a thin axum surface that:
//! - Validates the `msg` query parameter
//! - Publishes it through the [`ProducerAdapter`](crate::producer::ProducerAdapter)
//! - Maps adapter outcomes to status codes
//!
//! Routes are assembled by [`router`].

pub mod handlers;

pub use handlers::{
    health, router, send_message, AppState, ErrorResponse, HealthResponse, SendQuery,
};
