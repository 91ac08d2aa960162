use crate::index::Config;
use crate::model::GoalStateEvents;
use anyhow::Result;
use clap::Parser;
use std::num::{NonZeroU64, NonZeroUsize};
use tokio::{sync::mpsc, time::Duration};
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[clap(name = "dataplane", about = "A network policy dataplane engine")]
pub struct Args {
    #[clap(
        long,
        default_value = "netpol=info,warn",
        env = "NETPOL_DATAPLANE_LOG"
    )]
    pub log_level: String,

    #[clap(long, value_enum, default_value = "plain")]
    pub log_format: LogFormat,

    /// Seconds between reconciliation flushes.
    #[clap(long, default_value = "300")]
    pub reconcile_interval_secs: NonZeroU64,

    /// Republish every set and policy on each reconciliation.
    #[clap(long)]
    pub resync_on_reconcile: bool,

    /// The number of goal-state messages buffered for the enforcement agent.
    #[clap(long, default_value = "1024")]
    pub dispatch_queue_capacity: NonZeroUsize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl Args {
    /// Installs the global tracing subscriber.
    pub fn init_tracing(&self) -> Result<()> {
        let filter = EnvFilter::try_new(&self.log_level)?;
        let registry = tracing_subscriber::registry().with(filter);
        match self.log_format {
            LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
            LogFormat::Json => registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?,
        }
        Ok(())
    }

    pub fn config(&self) -> Config {
        Config {
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs.get()),
            resync_on_reconcile: self.resync_on_reconcile,
        }
    }

    /// Builds the bounded channel on which goal states are dispatched.
    pub fn channel(
        &self,
    ) -> (
        mpsc::Sender<GoalStateEvents>,
        mpsc::Receiver<GoalStateEvents>,
    ) {
        mpsc::channel(self.dispatch_queue_capacity.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["dataplane"]).unwrap();
        assert_eq!(args.log_format, LogFormat::Plain);
        assert_eq!(args.dispatch_queue_capacity.get(), 1024);

        let config = args.config();
        assert_eq!(config.reconcile_interval, crate::index::DEFAULT_RECONCILE_INTERVAL);
        assert!(!config.resync_on_reconcile);

        let (tx, _rx) = args.channel();
        assert_eq!(tx.max_capacity(), 1024);
    }

    #[test]
    fn overrides() {
        let args = Args::try_parse_from([
            "dataplane",
            "--log-format=json",
            "--reconcile-interval-secs=30",
            "--resync-on-reconcile",
            "--dispatch-queue-capacity=8",
        ])
        .unwrap();
        assert_eq!(args.log_format, LogFormat::Json);

        let config = args.config();
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert!(config.resync_on_reconcile);

        let (tx, _rx) = args.channel();
        assert_eq!(tx.max_capacity(), 8);
    }

    #[test]
    fn rejects_unbuffered_channel() {
        assert!(Args::try_parse_from(["dataplane", "--dispatch-queue-capacity=0"]).is_err());
    }

    #[test]
    fn rejects_zero_reconcile_interval() {
        assert!(Args::try_parse_from(["dataplane", "--reconcile-interval-secs=0"]).is_err());
    }
}
