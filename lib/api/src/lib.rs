//! HTTP surface for the semrel query engine

pub mod rest;

pub use rest::{ApiError, ApiState, RestApi};
