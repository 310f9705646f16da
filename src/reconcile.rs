//! Snapshot reconciliation and the ambassador run loop
//!
//! One task polls the topology source on a jittered interval and sends
//! each round's task list over a channel. A single consumer task shapes
//! the list into a [`Snapshot`] and reconciles the live [`ProxySet`]
//! against it: stale ports are closed, surviving ports get their
//! backend lists swapped, and new ports get listeners. Reconciliations
//! are strictly serialized, so the proxy set needs no locking of its
//! own.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::discovery::{TaskFilter, TaskSource};
use crate::proxy::Proxy;
use crate::topology::{Snapshot, Task};

/// The set of live proxies, keyed by container port. Owned exclusively
/// by the reconciler; at most one proxy exists per port.
#[derive(Default)]
pub struct ProxySet {
    proxies: HashMap<u16, Proxy>,
}

impl ProxySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, port: u16) -> Option<&Proxy> {
        self.proxies.get(&port)
    }

    pub fn ports(&self) -> Vec<u16> {
        self.proxies.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

/// Bring the proxy set into agreement with the snapshot.
///
/// Ports absent from the snapshot are torn down, force-closing their
/// active connections. Ports present with backends are created or have
/// their backend lists replaced. Ports present with an empty backend
/// list are left alone: no proxy is created for them, but an existing
/// proxy is not closed either, since losing all backends is distinct
/// from the port disappearing.
///
/// A bind failure on a new port is logged and skipped; the port stays
/// in subsequent snapshots, so it is retried on the next round.
pub async fn reconcile(snapshot: &Snapshot, set: &mut ProxySet) {
    let stale: Vec<u16> = set
        .proxies
        .keys()
        .copied()
        .filter(|port| !snapshot.contains_port(*port))
        .collect();
    for port in stale {
        warn!(port, "no longer listening on stale port");
        if let Some(proxy) = set.proxies.remove(&port) {
            proxy.close();
        }
    }

    for (port, backends) in snapshot.iter() {
        if backends.is_empty() {
            debug!(port, "no backends for port; leaving any existing proxy in place");
            continue;
        }
        if let Some(proxy) = set.proxies.get(&port) {
            proxy.update_backends(backends.clone());
            continue;
        }
        match Proxy::bind(port).await {
            Ok(proxy) => {
                info!(port, backends = backends.len(), "now proxying on port");
                // Backends go in before the accept loop starts, so the
                // first connection can never race an empty list.
                proxy.update_backends(backends.clone());
                let serving = proxy.clone();
                tokio::spawn(async move { serving.serve().await });
                set.proxies.insert(port, proxy);
            }
            Err(e) => {
                warn!(port, error = %e, "could not bind port; retrying next round");
            }
        }
    }
}

/// The ambassador: wires a topology source to the reconciler and runs
/// until the process exits.
pub struct Ambassador<S> {
    source: S,
    filter: TaskFilter,
}

impl<S> Ambassador<S>
where
    S: TaskSource + Send + 'static,
{
    pub fn new(source: S, filter: TaskFilter) -> Self {
        Self { source, filter }
    }

    /// Poll for task updates and reconcile each one in arrival order.
    /// Discovery errors are logged and retried on the next interval;
    /// this never returns under normal operation.
    pub async fn run(self) {
        let Self { source, filter } = self;
        let (tx, mut rx) = mpsc::channel::<Vec<Task>>(1);
        tokio::spawn(poll_tasks(source, filter.clone(), tx));

        let mut set = ProxySet::new();
        while let Some(tasks) = rx.recv().await {
            if tasks.is_empty() {
                debug!("no tasks in update; ignoring");
                continue;
            }
            let snapshot = Snapshot::build(&tasks, &filter.container, filter.public);
            if snapshot.is_empty() {
                // Continue anyway so stale listeners still get removed.
                warn!("no container ports; not proxying anything");
            }
            reconcile(&snapshot, &mut set).await;
        }
    }
}

/// Fetch the running task list forever, sleeping a jittered interval
/// between rounds. Failed rounds are logged and skipped; the consumer
/// simply keeps the previous proxy set.
async fn poll_tasks<S: TaskSource>(source: S, filter: TaskFilter, tx: mpsc::Sender<Vec<Task>>) {
    loop {
        debug!("updating task list");
        match source.tasks(&filter).await {
            Ok(tasks) => {
                if tx.send(tasks).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "error listing tasks"),
        }
        let interval = Duration::from_secs(rand::thread_rng().gen_range(5..10));
        tokio::time::sleep(interval).await;
    }
}
