//! Outbound request throttling shared by the Graph and LLM clients

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{Error, Result};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Requests-per-second pacing shared by every clone
#[derive(Clone)]
pub struct GlobalRateLimiter {
    limiter: Arc<DirectLimiter>,
}

impl GlobalRateLimiter {
    /// A rate of 0 is treated as 1 request per second
    pub fn new(requests_per_second: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
        }
    }

    /// Wait until a request is allowed
    pub async fn wait(&self) {
        self.limiter.until_ready().await;
        debug!("Rate limiter: request allowed");
    }
}

/// Caps the number of requests in flight and paces how fast new ones start.
///
/// Every extraction call holds a permit for its whole duration, so at most
/// `max_in_flight` calls are outstanding no matter how many emails and
/// fields a run fans out to.
#[derive(Clone)]
pub struct RequestGate {
    permits: Arc<Semaphore>,
    limiter: GlobalRateLimiter,
    max_in_flight: usize,
}

impl RequestGate {
    pub fn new(max_in_flight: usize, requests_per_second: u32) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            limiter: GlobalRateLimiter::new(requests_per_second),
            max_in_flight,
        }
    }

    /// Wait for a free slot, then for the rate limiter.
    ///
    /// Fails with [`Error::Cancelled`] once the gate has been closed, including
    /// for callers already waiting on a slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)?;
        self.limiter.wait().await;
        Ok(permit)
    }

    /// Stop handing out slots; permits already held stay valid
    pub fn close(&self) {
        self.permits.close();
    }

    /// Number of requests currently allowed to start without waiting on a slot
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }
}
