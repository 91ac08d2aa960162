use crate::Dataplane;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{info_span, Instrument};

/// Periodically re-flushes the dataplane to recover from changes that could not be dispatched.
#[derive(Debug)]
pub struct Reconciler {
    dataplane: Dataplane,
    period: Duration,
}

impl Reconciler {
    pub fn new(dataplane: Dataplane) -> Self {
        let period = dataplane.config().reconcile_interval;
        Self { dataplane, period }
    }

    /// Runs until `drain` is signaled. The drain handle is released when the loop exits.
    pub async fn run(self, drain: drain::Watch) {
        let Self { dataplane, period } = self;
        async move {
            let mut ticks = time::interval_at(time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tokio::pin! {
                let shutdown = drain.signaled();
            }

            loop {
                tokio::select! {
                    _ = ticks.tick() => dataplane.reconcile(),

                    release = &mut shutdown => {
                        tracing::debug!("reconciler shutting down");
                        drop(release);
                        return;
                    }
                }
            }
        }
        .instrument(info_span!("reconcile"))
        .await
    }
}
