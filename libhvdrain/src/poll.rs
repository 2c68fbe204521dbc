//! One polling primitive for every wait in a run: host state, reconnection
//! and drain completion. Fixed interval, optional iteration cap, cancellable.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    max_iterations: Option<u32>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Go ahead with poll number `n` (zero-based).
    Poll(u32),
    Exhausted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    Exhausted,
    Cancelled,
}

impl Poller {
    pub fn new(interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            interval,
            max_iterations: None,
            cancel,
        }
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start a fresh sequence of polls. Use this when the probe keeps state
    /// across iterations.
    pub fn ticker(&self) -> Ticker<'_> {
        Ticker {
            poller: self,
            iteration: 0,
        }
    }

    /// Poll `probe` until it yields a value, the iteration cap is hit or the
    /// poller is cancelled. Probe errors are returned immediately.
    pub async fn until<T, F, Fut>(&self, mut probe: F) -> Result<PollOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let mut ticker = self.ticker();
        loop {
            match ticker.tick().await {
                Tick::Poll(_) => {
                    if let Some(value) = probe().await? {
                        return Ok(PollOutcome::Ready(value));
                    }
                }
                Tick::Exhausted => return Ok(PollOutcome::Exhausted),
                Tick::Cancelled => return Ok(PollOutcome::Cancelled),
            }
        }
    }
}

#[derive(Debug)]
pub struct Ticker<'a> {
    poller: &'a Poller,
    iteration: u32,
}

impl<'a> Ticker<'a> {
    /// Sleeps for the interval (except before the first poll) and reports
    /// whether the caller should poll again.
    pub async fn tick(&mut self) -> Tick {
        if self.poller.cancel.is_cancelled() {
            return Tick::Cancelled;
        }
        if let Some(max) = self.poller.max_iterations {
            if self.iteration >= max {
                return Tick::Exhausted;
            }
        }
        if self.iteration > 0 {
            tokio::select! {
                _ = self.poller.cancel.cancelled() => return Tick::Cancelled,
                _ = tokio::time::sleep(self.poller.interval) => {}
            }
        }
        let n = self.iteration;
        self.iteration += 1;
        Tick::Poll(n)
    }
}
