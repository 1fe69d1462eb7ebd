use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::LimitConfig;

// per-class admission gate: up to max_running requests run, up to
// max_in_queue wait behind them for at most max_wait, everything beyond that
// is rejected outright. tokio's semaphore hands out permits in fifo order so
// waiters within a class are fair, and dropping a cancelled waiter's future
// gives its queue slot back
#[derive(Clone)]
pub struct AdmissionLimiter {
    running: Option<Arc<Semaphore>>,
    queue: Arc<Semaphore>,
    max_wait: Duration,
}

pub struct Admission {
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    QueueFull,
    WaitTimeout,
}

// how wrong is this?
impl std::fmt::Display for LimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl AdmissionLimiter {
    pub fn new(config: &LimitConfig) -> Self {
        let running = if config.max_running == 0 {
            None
        } else {
            Some(Arc::new(Semaphore::new(config.max_running)))
        };
        Self {
            running,
            queue: Arc::new(Semaphore::new(config.max_in_queue)),
            max_wait: config.max_wait(),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            running: None,
            queue: Arc::new(Semaphore::new(0)),
            max_wait: Duration::ZERO,
        }
    }

    pub async fn admit(&self, class: &'static str) -> Result<Admission, LimitError> {
        let Some(running) = &self.running else {
            return Ok(Admission { _permit: None });
        };

        if let Ok(permit) = running.clone().try_acquire_owned() {
            return Ok(Admission {
                _permit: Some(permit),
            });
        }

        // the queue slot is held only while waiting for a running permit
        let Ok(_queued) = self.queue.clone().try_acquire_owned() else {
            warn!("{} limiter queue full, rejecting", class);
            return Err(LimitError::QueueFull);
        };

        match tokio::time::timeout(self.max_wait, running.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Admission {
                _permit: Some(permit),
            }),
            Ok(Err(_)) => Err(LimitError::QueueFull),
            Err(_) => {
                warn!("{} limiter wait expired, rejecting", class);
                Err(LimitError::WaitTimeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_running: usize, max_in_queue: usize, max_wait_secs: u64) -> AdmissionLimiter {
        AdmissionLimiter::new(&LimitConfig {
            max_running,
            max_in_queue,
            max_wait_in_queue_secs: max_wait_secs,
        })
    }

    #[tokio::test]
    async fn test_admit_under_limit() {
        let l = limiter(2, 0, 1);
        let _a = l.admit("read").await.unwrap();
        let _b = l.admit("read").await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_when_queue_full() {
        let l = limiter(1, 0, 1);
        let _a = l.admit("read").await.unwrap();
        assert!(matches!(
            l.admit("read").await,
            Err(LimitError::QueueFull)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_request_times_out() {
        let l = limiter(1, 1, 1);
        let _a = l.admit("read").await.unwrap();
        assert!(matches!(
            l.admit("read").await,
            Err(LimitError::WaitTimeout)
        ));
    }

    #[tokio::test]
    async fn test_queued_request_admitted_when_slot_frees() {
        let l = limiter(1, 1, 5);
        let a = l.admit("read").await.unwrap();
        let l2 = l.clone();
        let waiter = tokio::spawn(async move { l2.admit("read").await });
        tokio::task::yield_now().await;
        drop(a);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unlimited() {
        let l = AdmissionLimiter::unlimited();
        for _ in 0..100 {
            l.admit("read").await.unwrap();
        }
    }
}
