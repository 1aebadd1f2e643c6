pub mod env_utils;
pub mod postgres_utils;
pub mod response_utils;
pub mod tracing_utils;
