mod api;

pub use api::{HealthResponse, ReadinessResponse};
