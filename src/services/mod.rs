pub mod auth_service;
pub mod metrics_service;
pub mod presence_service;
pub mod ratelimit_service;
