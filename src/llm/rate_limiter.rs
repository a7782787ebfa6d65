use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::clock::{elapsed_between, Clock};
use crate::error::{LinkBotError, Result};

/// Snapshot of a bucket's budget at the moment a call was admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitTicket {
    pub bucket: String,
    pub window_start: DateTime<Utc>,
    pub remaining: u32,
}

/// Admission for one call. The in-flight slot is released on drop.
#[derive(Debug)]
pub struct RateLimitPermit {
    pub ticket: RateLimitTicket,
    _in_flight: OwnedSemaphorePermit,
}

/// Rolling-window call budget with an independent concurrency cap.
///
/// Calls over either limit are rejected with `RateLimited` immediately;
/// nothing ever waits for a slot.
pub struct RateLimiter {
    bucket: String,
    max_calls: u32,
    window: Duration,
    calls: Mutex<VecDeque<DateTime<Utc>>>,
    in_flight: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        bucket: impl Into<String>,
        max_calls: u32,
        window: Duration,
        max_in_flight: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            max_calls,
            window,
            calls: Mutex::new(VecDeque::new()),
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            clock,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn try_acquire(&self) -> Result<RateLimitPermit> {
        let in_flight = match Arc::clone(&self.in_flight).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Bucket {} has no free in-flight slot", self.bucket);
                return Err(LinkBotError::RateLimited {
                    bucket: self.bucket.clone(),
                    retry_after: Duration::ZERO,
                });
            }
        };

        let now = self.clock.now();
        let mut calls = self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // Prune expired entries while we hold the lock
        while let Some(oldest) = calls.front() {
            if elapsed_between(*oldest, now) >= self.window {
                calls.pop_front();
            } else {
                break;
            }
        }

        if calls.len() as u32 >= self.max_calls {
            let retry_after = calls
                .front()
                .map(|oldest| self.window.saturating_sub(elapsed_between(*oldest, now)))
                .unwrap_or(self.window);
            debug!("Bucket {} exhausted, next slot in {:?}", self.bucket, retry_after);
            return Err(LinkBotError::RateLimited {
                bucket: self.bucket.clone(),
                retry_after,
            });
        }

        calls.push_back(now);
        let ticket = RateLimitTicket {
            bucket: self.bucket.clone(),
            window_start: calls.front().copied().unwrap_or(now),
            remaining: self.max_calls - calls.len() as u32,
        };

        Ok(RateLimitPermit {
            ticket,
            _in_flight: in_flight,
        })
    }

    /// Calls still admissible in the current window.
    pub fn remaining(&self) -> u32 {
        let now = self.clock.now();
        let calls = self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let recent = calls
            .iter()
            .filter(|&&t| elapsed_between(t, now) < self.window)
            .count() as u32;
        self.max_calls.saturating_sub(recent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max_calls: u32, max_in_flight: usize) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let limiter = RateLimiter::new("llm", max_calls, Duration::from_secs(60), max_in_flight, clock.clone());
        (limiter, clock)
    }

    #[test]
    fn test_eleventh_call_in_window_is_rejected() {
        let (limiter, _clock) = limiter(10, 10);

        for expected_remaining in (0..10).rev() {
            let permit = limiter.try_acquire().unwrap();
            assert_eq!(permit.ticket.remaining, expected_remaining);
        }

        match limiter.try_acquire() {
            Err(LinkBotError::RateLimited { bucket, retry_after }) => {
                assert_eq!(bucket, "llm");
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_window_rolls_over() {
        let (limiter, clock) = limiter(2, 4);
        let first = limiter.try_acquire().unwrap().ticket;
        clock.advance(Duration::from_secs(30));
        limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_err());

        clock.advance(Duration::from_secs(30));
        let ticket = limiter.try_acquire().unwrap().ticket;
        assert!(ticket.window_start > first.window_start);
        assert_eq!(ticket.remaining, 0);
        assert_eq!(limiter.remaining(), 0);

        clock.advance(Duration::from_secs(61));
        assert_eq!(limiter.remaining(), 2);
    }

    #[test]
    fn test_in_flight_cap_is_independent_of_budget() {
        let (limiter, _clock) = limiter(10, 1);
        let held = limiter.try_acquire().unwrap();
        assert!(matches!(limiter.try_acquire(), Err(LinkBotError::RateLimited { .. })));

        drop(held);
        assert!(limiter.try_acquire().is_ok());
        assert_eq!(limiter.remaining(), 8);
    }
}
