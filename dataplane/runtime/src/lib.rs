//! Wires the dataplane engine into a host process: configuration, logging, the reconciler task
//! and its shutdown.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;

pub use self::args::{Args, LogFormat};
pub use netpol_dataplane_core as model;
pub use netpol_dataplane_index as index;

use self::{
    index::{Config, Dataplane, DataplaneMetrics, Reconciler},
    model::GoalStateEvents,
};
use anyhow::Result;
use prometheus_client::registry::Registry;
use tokio::{sync::mpsc, task::JoinHandle};

/// A running dataplane engine and its reconciler.
#[derive(Debug)]
pub struct Runtime {
    dataplane: Dataplane,
    signal: drain::Signal,
    task: JoinHandle<()>,
}

impl Runtime {
    /// Builds the engine and spawns its reconciler. Must be called from within a Tokio runtime.
    pub fn start(
        config: Config,
        tx: mpsc::Sender<GoalStateEvents>,
        prom: &mut Registry,
    ) -> Result<Self> {
        let metrics = DataplaneMetrics::register(prom.sub_registry_with_prefix("netpol_dataplane"));
        let dataplane = Dataplane::new(config, tx, metrics)?;

        let (signal, watch) = drain::channel();
        let task = tokio::spawn(Reconciler::new(dataplane.clone()).run(watch));
        tracing::info!(
            interval = ?dataplane.config().reconcile_interval,
            resync = dataplane.config().resync_on_reconcile,
            "started dataplane",
        );

        Ok(Self {
            dataplane,
            signal,
            task,
        })
    }

    pub fn dataplane(&self) -> Dataplane {
        self.dataplane.clone()
    }

    /// Stops the reconciler and waits for it to complete.
    ///
    /// Changes that have not been dispatched are not flushed.
    pub async fn shutdown(self) -> Result<()> {
        let Self { signal, task, .. } = self;
        signal.drain().await;
        task.await?;
        tracing::info!("dataplane stopped");
        Ok(())
    }
}
