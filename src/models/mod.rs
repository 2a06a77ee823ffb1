mod api;

pub use api::{HealthResponse, MeResponse};
