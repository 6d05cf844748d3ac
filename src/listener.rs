//! Per-port listener tasks.
//!
//! A listener is only handed back (and so only registered) once its socket
//! is bound. It then runs until its accept/receive call fails, at which point
//! it evicts itself, or until the reconciler aborts it.

use anyhow::{Context, Result};
use std::{
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Weak},
};
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::watch,
};
use tracing::{debug, error, info, warn};

use crate::{
    forward::{MAX_DATAGRAM_SIZE, forward_datagram, forward_tcp},
    registry::{ListenerHandle, ListenerId, ListenerRegistry, Transport},
    route::Route,
};

/// Binds `bind_ip:port` for `transport` and starts serving it with `route`.
pub async fn open(
    registry: &Arc<ListenerRegistry>,
    transport: Transport,
    bind_ip: IpAddr,
    port: u16,
    route: Route,
) -> Result<ListenerHandle> {
    match transport {
        Transport::Tcp => open_tcp(registry, bind_ip, port, route).await,
        Transport::Udp => open_udp(registry, bind_ip, port, route).await,
    }
}

pub async fn open_tcp(
    registry: &Arc<ListenerRegistry>,
    bind_ip: IpAddr,
    port: u16,
    route: Route,
) -> Result<ListenerHandle> {
    let addr = SocketAddr::new(bind_ip, port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind TCP listener on {addr}"))?;
    serve_tcp(registry, listener, route)
}

/// Starts the accept loop on an already bound listener. The loop evicts
/// its registry entry under the listener's own port.
pub fn serve_tcp(
    registry: &Arc<ListenerRegistry>,
    listener: TcpListener,
    route: Route,
) -> Result<ListenerHandle> {
    let local_addr = listener
        .local_addr()
        .context("Failed to get TCP listener local address")?;

    let id = registry.next_id();
    let (route_tx, route_rx) = watch::channel(route);
    let task = tokio::spawn(accept_loop(
        listener,
        local_addr.port(),
        id,
        route_rx,
        Arc::downgrade(registry),
    ));

    Ok(ListenerHandle::new(id, local_addr, route_tx, task))
}

pub async fn open_udp(
    registry: &Arc<ListenerRegistry>,
    bind_ip: IpAddr,
    port: u16,
    route: Route,
) -> Result<ListenerHandle> {
    let addr = SocketAddr::new(bind_ip, port);
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("Failed to bind UDP socket on {addr}"))?;
    let local_addr = socket
        .local_addr()
        .context("Failed to get UDP socket local address")?;

    let id = registry.next_id();
    let (route_tx, route_rx) = watch::channel(route);
    let task = tokio::spawn(receive_loop(
        Arc::new(socket),
        port,
        id,
        route_rx,
        Arc::downgrade(registry),
    ));

    Ok(ListenerHandle::new(id, local_addr, route_tx, task))
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    id: ListenerId,
    routes: watch::Receiver<Route>,
    registry: Weak<ListenerRegistry>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, client_addr)) => {
                let route = routes.borrow().clone();
                debug!(
                    port,
                    client_addr = %client_addr,
                    target_addr = %route.target_addr(),
                    "Accepted connection"
                );

                tokio::spawn(async move {
                    if let Err(e) = forward_tcp(stream, client_addr, route).await {
                        warn!(port, client_addr = %client_addr, error = %format!("{e:#}"), "Connection failed");
                    }
                });
            }
            Err(e) => {
                error!(port, error = %e, "Accept failed, stopping TCP listener");
                break;
            }
        }
    }

    drop(listener);
    evict(&registry, Transport::Tcp, port, id).await;
    info!(port, "TCP listener stopped");
}

/// Each datagram is forwarded on its own task holding a clone of `socket`,
/// so the port stays bound until those sends finish even after this loop
/// has been aborted.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    port: u16,
    id: ListenerId,
    routes: watch::Receiver<Route>,
    registry: Weak<ListenerRegistry>,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((n, source)) => {
                let payload = buffer[..n].to_vec();
                let route = routes.borrow().clone();
                let socket = Arc::clone(&socket);

                tokio::spawn(async move {
                    if let Err(e) = forward_datagram(&socket, &payload, source, &route).await {
                        warn!(port, source_addr = %source, error = %format!("{e:#}"), "Dropping datagram");
                    }
                });
            }
            Err(e) if is_transient_udp_error(&e) => {
                debug!(port, error = %e, "Ignoring ICMP error reported on UDP socket");
            }
            Err(e) => {
                error!(port, error = %e, "Receive failed, stopping UDP listener");
                break;
            }
        }
    }

    drop(socket);
    evict(&registry, Transport::Udp, port, id).await;
    info!(port, "UDP listener stopped");
}

/// Some platforms surface ICMP unreachable from an earlier `send_to` as a
/// receive error on the same socket.
fn is_transient_udp_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused
    )
}

async fn evict(registry: &Weak<ListenerRegistry>, transport: Transport, port: u16, id: ListenerId) {
    if let Some(registry) = registry.upgrade() {
        registry.evict(transport, port, id).await;
    }
}
