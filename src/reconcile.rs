//! Converges the live listener set onto the route store's desired state.

use std::{future::Future, net::IpAddr, sync::Arc, time::Duration};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    listener,
    registry::{ListenerRegistry, Listeners, Transport},
    route::RouteTable,
    store::RouteSource,
};

pub struct Reconciler<S> {
    source: S,
    registry: Arc<ListenerRegistry>,
    bind_ip: IpAddr,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CycleSummary {
    opened: usize,
    closed: usize,
    retargeted: usize,
    bind_failures: usize,
}

impl<S: RouteSource> Reconciler<S> {
    pub fn new(source: S, registry: Arc<ListenerRegistry>, bind_ip: IpAddr) -> Self {
        Self {
            source,
            registry,
            bind_ip,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// Runs one cycle: fetch, then open and close listeners under the lock.
    ///
    /// A failed fetch leaves every listener as it was.
    pub async fn reconcile(&self) {
        let table = match self.source.fetch().await {
            Ok(table) => table,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Failed to load routes, keeping current listeners");
                return;
            }
        };

        let summary = self.converge(&table).await;
        if summary == CycleSummary::default() {
            debug!(routes = table.len(), "Listeners already match routes");
        } else {
            info!(
                routes = table.len(),
                opened = summary.opened,
                closed = summary.closed,
                retargeted = summary.retargeted,
                bind_failures = summary.bind_failures,
                "Reconciled listeners"
            );
        }
    }

    /// Opens missing listeners before closing stale ones, all under one
    /// hold of the registry lock.
    async fn converge(&self, table: &RouteTable) -> CycleSummary {
        let mut listeners = self.registry.lock().await;
        let mut summary = CycleSummary::default();

        for transport in Transport::ALL {
            self.open_missing(&mut listeners, table, transport, &mut summary)
                .await;
        }
        for transport in Transport::ALL {
            Self::close_stale(&mut listeners, table, transport, &mut summary).await;
        }

        summary
    }

    async fn open_missing(
        &self,
        listeners: &mut Listeners,
        table: &RouteTable,
        transport: Transport,
        summary: &mut CycleSummary,
    ) {
        for (port, route) in table.iter() {
            if !transport.is_carried_by(route.protocol) {
                continue;
            }

            if let Some(handle) = listeners.get(transport, port) {
                let retargeted = !handle.route().same_target(route);
                if handle.update_route(route) && retargeted {
                    summary.retargeted += 1;
                    info!(%transport, port, target_addr = %route.target_addr(), "Route target updated");
                }
                continue;
            }

            match listener::open(&self.registry, transport, self.bind_ip, port, route.clone()).await
            {
                Ok(handle) => {
                    info!(
                        %transport,
                        port,
                        listen_addr = %handle.local_addr(),
                        target_addr = %route.target_addr(),
                        "Listening"
                    );
                    listeners.insert(transport, port, handle);
                    summary.opened += 1;
                }
                Err(e) => {
                    summary.bind_failures += 1;
                    warn!(%transport, port, error = %format!("{e:#}"), "Failed to start listener");
                }
            }
        }
    }

    /// Closes listeners whose port left the table or no longer carries
    /// `transport`.
    async fn close_stale(
        listeners: &mut Listeners,
        table: &RouteTable,
        transport: Transport,
        summary: &mut CycleSummary,
    ) {
        let stale: Vec<u16> = listeners
            .ports(transport)
            .into_iter()
            .filter(|port| {
                !table
                    .get(*port)
                    .is_some_and(|route| transport.is_carried_by(route.protocol))
            })
            .collect();

        for port in stale {
            if let Some(handle) = listeners.remove(transport, port) {
                handle.close().await;
                summary.closed += 1;
                info!(%transport, port, "Stopped listener");
            }
        }
    }

    /// Reconciles now, then every `period`, until `shutdown` resolves.
    /// Cycles never overlap; a cycle that overruns delays the next tick.
    pub async fn run(&self, period: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => self.reconcile().await,
            }
        }

        info!("Shutting down listeners");
        self.shutdown().await;
    }

    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}
