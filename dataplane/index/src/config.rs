use tokio::time::Duration;

/// The production reconciliation period.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug)]
pub struct Config {
    /// How often the reconciler re-flushes state independently of mutations.
    pub reconcile_interval: Duration,

    /// When set, each reconciliation republishes every set and policy rather than only the
    /// changes that could not be dispatched.
    pub resync_on_reconcile: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            resync_on_reconcile: false,
        }
    }
}
