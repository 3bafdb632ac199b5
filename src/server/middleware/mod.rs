// src/server/middleware/mod.rs
pub mod rate_limit;
pub mod validation;

// Re-export main components for cleaner imports
pub use rate_limit::{ConnectionRateLimiter, MessageRateLimiter};
pub use validation::{validate_post, validate_username};
