//! Rate limiting for the public onboarding endpoint.
//!
//! Every `/add` call runs admission, allocation and a signer process, so the
//! endpoint is throttled globally before any of that work starts.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

use super::error::ApiError;

const DEFAULT_PER_SECOND: NonZeroU32 = match NonZeroU32::new(2) {
    Some(n) => n,
    None => unreachable!(),
};
const DEFAULT_BURST: NonZeroU32 = match NonZeroU32::new(10) {
    Some(n) => n,
    None => unreachable!(),
};

/// Shared token bucket for onboarding requests.
#[derive(Clone)]
pub struct OnboardingRateLimiter {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl OnboardingRateLimiter {
    /// Create a limiter allowing `per_second` sustained requests with bursts
    /// up to `burst_size`. Zero values fall back to 2/s and a burst of 10.
    pub fn new(per_second: u32, burst_size: u32) -> Self {
        let per_second = NonZeroU32::new(per_second).unwrap_or(DEFAULT_PER_SECOND);
        let burst_size = NonZeroU32::new(burst_size).unwrap_or(DEFAULT_BURST);

        let quota = Quota::per_second(per_second).allow_burst(burst_size);

        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Take one token, or fail with 429.
    pub fn check(&self) -> Result<(), ApiError> {
        self.limiter.check().map_err(|_| {
            tracing::warn!("Rate limit exceeded for onboarding endpoint");
            ApiError::too_many_requests()
        })
    }
}

impl Default for OnboardingRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_PER_SECOND.get(), DEFAULT_BURST.get())
    }
}

/// Axum middleware rejecting requests over the limit.
pub async fn rate_limit(
    State(limiter): State<OnboardingRateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    match limiter.check() {
        Ok(()) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}
