//! Retrying a fallible async operation under a policy.
//!
//! A finished future must not be polled again, so the caller hands over a
//! factory that builds a fresh future per attempt.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use crate::log::*;

/// What to do after attempt `n` failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction<E: Debug> {
    RetryNow,
    WaitFor(Duration),
    ReturnError(E),
}

pub trait RetryPolicy<E: Debug> {
    fn on_err(&mut self, attempt: u32, err: E) -> RetryAction<E>;
}

impl<P, E: Debug> RetryPolicy<E> for P
where
    P: FnMut(u32, E) -> RetryAction<E>,
{
    fn on_err(&mut self, attempt: u32, err: E) -> RetryAction<E> {
        (*self)(attempt, err)
    }
}

pub async fn retry_future<T, E, F, FF>(mut factory: FF, mut policy: impl RetryPolicy<E>) -> Result<T, E>
where
    E: Debug,
    F: Future<Output = Result<T, E>>,
    FF: FnMut(u32) -> F,
{
    let mut attempt = 0u32;
    loop {
        match factory(attempt).await {
            Ok(x) => return Ok(x),
            Err(e) => {
                let action = policy.on_err(attempt, e);
                debug!("retry: attempt {} => {:?}", attempt, action);
                match action {
                    RetryAction::RetryNow => {}
                    RetryAction::WaitFor(duration) => tokio::time::sleep(duration).await,
                    RetryAction::ReturnError(err) => return Err(err),
                }
            }
        }
        attempt += 1;
    }
}

/// Retry up to `retries` more times, immediately, while `retriable` holds.
pub fn immediate<E: Debug>(
    retries: u32,
    retriable: impl Fn(&E) -> bool,
) -> impl FnMut(u32, E) -> RetryAction<E> {
    move |attempt, err| {
        if attempt < retries && retriable(&err) {
            RetryAction::RetryNow
        } else {
            RetryAction::ReturnError(err)
        }
    }
}

/// Make at most `attempts` attempts, sleeping `backoff` between them.
pub fn fixed_backoff<E: Debug>(
    attempts: u32,
    backoff: Duration,
) -> impl FnMut(u32, E) -> RetryAction<E> {
    move |attempt, err| {
        if attempt + 1 < attempts {
            RetryAction::WaitFor(backoff)
        } else {
            RetryAction::ReturnError(err)
        }
    }
}
