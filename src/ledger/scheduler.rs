//! Recurring wakeup used to drive the poller

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Work run on every wakeup
pub type TickHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A recurring wakeup. Ticks may be delayed or skipped by the host.
#[cfg_attr(test, mockall::automock)]
pub trait Scheduler: Send + Sync {
    /// Start ticking every `interval`. No-op while already armed.
    fn arm(&self, interval: Duration);

    /// Stop ticking.
    fn disarm(&self);

    fn on_tick(&self, handler: TickHandler);
}

/// Scheduler backed by a tokio interval task
#[derive(Default)]
pub struct TokioScheduler {
    handler: Mutex<Option<TickHandler>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl Scheduler for TokioScheduler {
    fn arm(&self, period: Duration) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        let handler = match self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            Some(handler) => handler,
            None => {
                warn!("Scheduler armed without a tick handler");
                return;
            }
        };

        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                handler().await;
            }
        }));
        debug!("Scheduler armed every {:?}", period);
    }

    fn disarm(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
            debug!("Scheduler disarmed");
        }
    }

    fn on_tick(&self, handler: TickHandler) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}
