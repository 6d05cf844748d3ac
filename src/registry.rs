//! Live listener state, shared between the reconciler and listener tasks.
//!
//! Every read and write goes through the one [`ListenerRegistry`] lock. The
//! reconciler owns insertions and removals; a listener task may only remove
//! its own entry after its socket failed (self-eviction).

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::{
    sync::{Mutex, MutexGuard, watch},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::route::{Protocol, Route};

/// Identity of one listener instance. A port that is closed and reopened
/// gets a new id, so churn is observable.
pub type ListenerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub const ALL: [Self; 2] = [Self::Tcp, Self::Udp];

    #[must_use]
    pub const fn is_carried_by(self, protocol: Protocol) -> bool {
        match self {
            Self::Tcp => protocol.includes_tcp(),
            Self::Udp => protocol.includes_udp(),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        })
    }
}

/// A running listener: its accept/receive task and the route slot it reads
/// the current target from.
pub struct ListenerHandle {
    id: ListenerId,
    local_addr: SocketAddr,
    route: watch::Sender<Route>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub(crate) fn new(
        id: ListenerId,
        local_addr: SocketAddr,
        route: watch::Sender<Route>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            local_addr,
            route,
            task,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ListenerId {
        self.id
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The route new connections and datagrams on this listener will use.
    #[must_use]
    pub fn route(&self) -> Route {
        self.route.borrow().clone()
    }

    /// Publishes `route` to the listener. Returns whether it differed.
    pub(crate) fn update_route(&self, route: &Route) -> bool {
        self.route.send_if_modified(|current| {
            if current == route {
                false
            } else {
                current.clone_from(route);
                true
            }
        })
    }

    /// Stops the task and waits until it has dropped its socket handle.
    ///
    /// A UDP socket is shared with in-flight per-datagram sends, so it is
    /// only released once those finish resolving and sending.
    pub(crate) async fn close(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The two port → listener maps. Only reachable through the registry lock.
#[derive(Default)]
pub struct Listeners {
    tcp: HashMap<u16, ListenerHandle>,
    udp: HashMap<u16, ListenerHandle>,
}

impl Listeners {
    fn map(&self, transport: Transport) -> &HashMap<u16, ListenerHandle> {
        match transport {
            Transport::Tcp => &self.tcp,
            Transport::Udp => &self.udp,
        }
    }

    fn map_mut(&mut self, transport: Transport) -> &mut HashMap<u16, ListenerHandle> {
        match transport {
            Transport::Tcp => &mut self.tcp,
            Transport::Udp => &mut self.udp,
        }
    }

    #[must_use]
    pub fn get(&self, transport: Transport, port: u16) -> Option<&ListenerHandle> {
        self.map(transport).get(&port)
    }

    #[must_use]
    pub fn contains(&self, transport: Transport, port: u16) -> bool {
        self.map(transport).contains_key(&port)
    }

    /// Ports with a listener for `transport`, in ascending order.
    #[must_use]
    pub fn ports(&self, transport: Transport) -> Vec<u16> {
        let mut ports: Vec<u16> = self.map(transport).keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tcp.len() + self.udp.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty() && self.udp.is_empty()
    }

    pub(crate) fn insert(
        &mut self,
        transport: Transport,
        port: u16,
        handle: ListenerHandle,
    ) -> Option<ListenerHandle> {
        self.map_mut(transport).insert(port, handle)
    }

    pub(crate) fn remove(&mut self, transport: Transport, port: u16) -> Option<ListenerHandle> {
        self.map_mut(transport).remove(&port)
    }

    fn snapshot(&self) -> RegistrySnapshot {
        let ids = |map: &HashMap<u16, ListenerHandle>| {
            map.iter()
                .map(|(port, handle)| (*port, handle.id))
                .collect::<BTreeMap<_, _>>()
        };
        RegistrySnapshot {
            tcp: ids(&self.tcp),
            udp: ids(&self.udp),
        }
    }
}

/// Point-in-time view of which listener instance serves each port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub tcp: BTreeMap<u16, ListenerId>,
    pub udp: BTreeMap<u16, ListenerId>,
}

impl RegistrySnapshot {
    #[must_use]
    pub fn ports(&self, transport: Transport) -> BTreeSet<u16> {
        match transport {
            Transport::Tcp => self.tcp.keys().copied().collect(),
            Transport::Udp => self.udp.keys().copied().collect(),
        }
    }

    #[must_use]
    pub fn id(&self, transport: Transport, port: u16) -> Option<ListenerId> {
        match transport {
            Transport::Tcp => self.tcp.get(&port).copied(),
            Transport::Udp => self.udp.get(&port).copied(),
        }
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Listeners>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the registry lock. Hold the guard for the whole of any
    /// check-then-modify sequence.
    pub async fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().await
    }

    pub(crate) fn next_id(&self) -> ListenerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.lock().await.snapshot()
    }

    pub async fn local_addr(&self, transport: Transport, port: u16) -> Option<SocketAddr> {
        self.lock()
            .await
            .get(transport, port)
            .map(ListenerHandle::local_addr)
    }

    /// Removes the entry for `port` only if it is still listener `id`, so a
    /// dying task never evicts the instance that replaced it.
    pub async fn evict(&self, transport: Transport, port: u16, id: ListenerId) -> bool {
        let mut listeners = self.lock().await;
        if listeners.get(transport, port).is_some_and(|handle| handle.id == id) {
            listeners.remove(transport, port);
            debug!(%transport, port, id, "Listener evicted itself");
            true
        } else {
            false
        }
    }

    /// Closes and removes every listener.
    pub async fn close_all(&self) {
        let mut listeners = self.lock().await;
        for transport in Transport::ALL {
            for port in listeners.ports(transport) {
                if let Some(handle) = listeners.remove(transport, port) {
                    handle.close().await;
                    info!(%transport, port, "Stopped listener");
                }
            }
        }
    }
}
