use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::debug;

/// A background job that runs `work` every `period` until stopped.
/// The first run happens one period after spawning.
pub struct PeriodicTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut work: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut rx) = watch::channel(false);
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => work().await,
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("periodic task {} stopped", name);
        });
        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals the loop and waits for it; an in-flight run is allowed to finish.
    pub async fn stop(self) {
        debug!("stopping periodic task {}", self.name());
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

pub async fn stop_all(tasks: Vec<PeriodicTask>) {
    futures_util::future::join_all(tasks.into_iter().map(PeriodicTask::stop)).await;
}
