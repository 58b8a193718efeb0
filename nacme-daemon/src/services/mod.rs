//! HTTP service implementations.

pub mod admin;
mod error;
pub mod onboarding;
mod rate_limit;

pub use error::ApiError;
pub use rate_limit::OnboardingRateLimiter;
