//! Per-port TCP proxy engine
//!
//! A [`Proxy`] owns one local listener and a hot-swappable list of
//! backend "ip:port" addresses. Every accepted connection picks a
//! backend uniformly at random, dials it with a bounded timeout, and
//! relays bytes in both directions until either side closes. The
//! backend list and the set of live relays are guarded by separate
//! locks so a backend swap never contends with connection churn, and no
//! lock is held across a network operation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::ProxyError;

/// How long to wait for a backend dial before giving up on the
/// connection. No retry and no alternate backend is attempted.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A TCP proxy for a single local port. Cheap to clone; all clones
/// share the same listener, backend list, and connection registry.
///
/// Lifecycle: [`Proxy::bind`] acquires the listener, [`Proxy::serve`]
/// runs the accept loop until [`Proxy::close`] shuts everything down.
/// `close` is terminal: it stops the accept loop, drops the listener,
/// and force-closes every tracked backend connection without waiting
/// for their relays to finish.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

struct Inner {
    port: u16,
    local_addr: SocketAddr,
    /// True from successful bind until close; the listener is open iff
    /// this is set.
    active: AtomicBool,
    /// Current backends, replaced wholesale on update. Readers take the
    /// lock only for the duration of one random pick.
    backends: RwLock<Vec<String>>,
    /// Live relay tasks by connection id. Separate lock from the
    /// backend list so close/teardown never contends with selection.
    conns: Mutex<HashMap<u64, AbortHandle>>,
    next_conn_id: AtomicU64,
    /// Per-proxy RNG so backend selection is reproducible under test.
    rng: Mutex<SmallRng>,
    /// Handed to `serve` exactly once.
    listener: Mutex<Option<TcpListener>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Proxy {
    /// Bind a listener on the given port. Fails immediately if the port
    /// is unavailable; the caller decides whether to retry.
    pub async fn bind(port: u16) -> Result<Self, ProxyError> {
        Self::bind_with_rng(port, SmallRng::from_entropy()).await
    }

    /// Bind with a seeded RNG, for deterministic backend selection in
    /// tests.
    pub async fn bind_with_seed(port: u16, seed: u64) -> Result<Self, ProxyError> {
        Self::bind_with_rng(port, SmallRng::seed_from_u64(seed)).await
    }

    async fn bind_with_rng(port: u16, rng: SmallRng) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| ProxyError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind { port, source })?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                port,
                local_addr,
                active: AtomicBool::new(true),
                backends: RwLock::new(Vec::new()),
                conns: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(0),
                rng: Mutex::new(rng),
                listener: Mutex::new(Some(listener)),
                shutdown_tx,
            }),
        })
    }

    /// The port this proxy was asked to listen on.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// The address the listener actually bound (useful when binding
    /// port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Number of currently tracked backend connections.
    pub fn active_connections(&self) -> usize {
        self.inner.conns.lock().len()
    }

    /// Atomically replace the backend list. Visible to the next
    /// selection; connections already relaying are unaffected and stay
    /// bound to the backend they dialed.
    pub fn update_backends(&self, addrs: Vec<String>) {
        debug!(port = self.inner.port, backends = addrs.len(), "updating backends");
        *self.inner.backends.write() = addrs;
    }

    /// Run the accept loop. Blocks until the proxy is closed; transient
    /// accept errors are logged and accepting continues. Each accepted
    /// connection is handled on its own task and never blocks the loop.
    pub async fn serve(&self) {
        let listener = match self.inner.listener.lock().take() {
            Some(listener) => listener,
            None => {
                warn!(port = self.inner.port, "accept loop already started or proxy closed");
                return;
            }
        };
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        info!(addr = %self.inner.local_addr, "proxy listening");

        while self.inner.active.load(Ordering::SeqCst) {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((client, peer)) => {
                        debug!(port = self.inner.port, peer = %peer, "accepted connection");
                        let inner = Arc::clone(&self.inner);
                        tokio::spawn(handle_client(inner, client));
                    }
                    Err(e) => {
                        if !self.inner.active.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(port = self.inner.port, error = %e, "error accepting connection");
                    }
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(port = self.inner.port, "accept loop stopped");
    }

    /// Stop accepting, drop the listener, and force-close every tracked
    /// backend connection. Does not wait for relays to finish; aborting
    /// them drops both of their sockets, which unblocks any pending
    /// reads and writes. Safe to call more than once.
    pub fn close(&self) {
        if self.inner.active.swap(false, Ordering::SeqCst) {
            info!(addr = %self.inner.local_addr, "closing proxy");
        }
        self.inner.shutdown_tx.send_replace(true);
        // If serve never ran, release the port here.
        self.inner.listener.lock().take();

        let mut conns = self.inner.conns.lock();
        for (_, handle) in conns.drain() {
            handle.abort();
        }
    }
}

impl Inner {
    /// Pick a backend uniformly at random. The backend-list lock is
    /// released before returning, so it is never held while dialing.
    fn pick_backend(&self) -> Option<String> {
        let backends = self.backends.read();
        if backends.is_empty() {
            return None;
        }
        let idx = self.rng.lock().gen_range(0..backends.len());
        Some(backends[idx].clone())
    }

    /// Register a relay task. Checked against liveness under the
    /// connection lock so a close racing a fresh dial still tears the
    /// connection down.
    fn track(&self, handle: AbortHandle) -> Option<u64> {
        let mut conns = self.conns.lock();
        if !self.active.load(Ordering::SeqCst) {
            handle.abort();
            return None;
        }
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        conns.insert(id, handle);
        Some(id)
    }

    fn untrack(&self, id: u64) {
        self.conns.lock().remove(&id);
    }
}

/// Handle one accepted connection: select a backend, dial it, and relay
/// until done. Every failure path simply drops the inbound connection;
/// nothing here can hang a client on an empty or unreachable backend
/// list.
async fn handle_client(inner: Arc<Inner>, client: TcpStream) {
    let Some(backend) = inner.pick_backend() else {
        debug!(port = inner.port, "no viable backends; dropping connection");
        return;
    };

    let backend_conn = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(backend.as_str())).await
    {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            warn!(port = inner.port, backend = %backend, error = %e, "could not dial backend");
            return;
        }
        Err(_) => {
            warn!(port = inner.port, backend = %backend, "timed out dialing backend");
            return;
        }
    };

    debug!(port = inner.port, backend = %backend, "proxying connection");
    let relay = tokio::spawn(relay(client, backend_conn, inner.port, backend));

    let Some(id) = inner.track(relay.abort_handle()) else {
        // Proxy closed while we were dialing; the relay was aborted at
        // registration. Reap it and bail.
        let _ = relay.await;
        return;
    };

    // A JoinError here means the relay was aborted by close(), which is
    // normal teardown rather than a fault.
    let _ = relay.await;
    inner.untrack(id);
}

/// Pump bytes both ways until each direction reaches end-of-stream or
/// either errors. Both sockets are dropped (closed) on the way out.
async fn relay(mut client: TcpStream, mut backend: TcpStream, port: u16, backend_addr: String) {
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((to_backend, from_backend)) => {
            debug!(port, backend = %backend_addr, to_backend, from_backend, "relay finished");
        }
        Err(e) => {
            debug!(port, backend = %backend_addr, error = %e, "relay ended with error");
        }
    }
}
