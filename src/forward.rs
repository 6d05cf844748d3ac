use anyhow::{Context, Result, anyhow};
use std::net::SocketAddr;
use tokio::{
    io::{self, AsyncWriteExt},
    net::{TcpStream, UdpSocket, lookup_host},
};
use tracing::{debug, info};

use crate::route::Route;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Dials the route's target and relays bytes both ways until the exchange ends.
///
/// On dial failure the accepted connection is dropped, which closes it.
#[tracing::instrument(skip(client, route), fields(target_addr = %route.target_addr()))]
pub async fn forward_tcp(client: TcpStream, client_addr: SocketAddr, route: Route) -> Result<()> {
    let target_addr = route.target_addr();

    debug!("Attempting to connect to target server");
    let target = TcpStream::connect(&target_addr)
        .await
        .with_context(|| format!("Failed to connect to target {target_addr}"))?;

    debug!("Connected to target server");
    relay(client, target).await?;

    info!("Proxy connection closed");
    Ok(())
}

/// Copies client→target on a spawned task and target→client on this one.
///
/// A clean EOF from the client half-closes the target and keeps the reverse
/// direction running. Anything else ending one direction tears down both.
async fn relay(client: TcpStream, target: TcpStream) -> Result<()> {
    let (mut client_reader, mut client_writer) = client.into_split();
    let (mut target_reader, mut target_writer) = target.into_split();

    let mut client_to_target = tokio::spawn(async move {
        let copied = io::copy(&mut client_reader, &mut target_writer).await;
        let _ = target_writer.shutdown().await;
        copied
    });

    let target_to_client = async move {
        let copied = io::copy(&mut target_reader, &mut client_writer).await;
        let _ = client_writer.shutdown().await;
        copied
    };
    tokio::pin!(target_to_client);

    tokio::select! {
        result = &mut target_to_client => {
            client_to_target.abort();
            let received = result.context("Failed to relay target data to client")?;
            debug!(bytes = received, "Target closed connection");
        }
        joined = &mut client_to_target => {
            let sent = joined
                .context("Client relay task failed")?
                .context("Failed to relay client data to target")?;
            debug!(bytes = sent, "Client finished sending");

            let received = target_to_client
                .await
                .context("Failed to relay target data to client")?;
            debug!(bytes = received, "Target closed connection");
        }
    }

    Ok(())
}

/// Sends one datagram to the route's target from the listener's own socket.
pub async fn forward_datagram(
    socket: &UdpSocket,
    payload: &[u8],
    source: SocketAddr,
    route: &Route,
) -> Result<()> {
    let target_addr = route.target_addr();
    let target = resolve_for(socket, &target_addr).await?;

    let sent = socket
        .send_to(payload, target)
        .await
        .with_context(|| format!("Failed to send datagram to {target_addr}"))?;

    debug!(
        source_addr = %source,
        target_addr = %target,
        bytes = sent,
        "Forwarded datagram"
    );
    Ok(())
}

/// Resolves `target_addr`, preferring an address in the socket's own family.
async fn resolve_for(socket: &UdpSocket, target_addr: &str) -> Result<SocketAddr> {
    let local_is_ipv4 = socket
        .local_addr()
        .context("Failed to read UDP socket local address")?
        .is_ipv4();

    let candidates: Vec<SocketAddr> = lookup_host(target_addr)
        .await
        .with_context(|| format!("Failed to resolve UDP target {target_addr}"))?
        .collect();

    candidates
        .iter()
        .find(|addr| addr.is_ipv4() == local_is_ipv4)
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| anyhow!("UDP target {target_addr} resolved to no addresses"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Protocol;
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        time::timeout,
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    async fn find_free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Starts TCP echo server on free port, returns port number
    async fn start_echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buffer = [0; 4096];
                    loop {
                        match stream.read(&mut buffer).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) if stream.write_all(&buffer[..n]).await.is_err() => break,
                            Ok(_) => {}
                        }
                    }
                });
            }
        });

        port
    }

    /// Accepts one proxy-side connection and hands it to `forward_tcp`.
    async fn start_forwarder(target_port: u16) -> (u16, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let route = Route::new("127.0.0.1", target_port, Protocol::Tcp).unwrap();

        let task = tokio::spawn(accept_and_forward(listener, route));

        (port, task)
    }

    async fn accept_and_forward(listener: TcpListener, route: Route) -> Result<()> {
        let (stream, client_addr) = listener.accept().await?;
        forward_tcp(stream, client_addr, route).await
    }

    mod tcp {
        use super::*;

        #[tokio::test]
        async fn round_trips_bytes_through_echo_target() {
            let echo_port = start_echo_server().await;
            let (proxy_port, _) = start_forwarder(echo_port).await;

            let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
            let payload = b"Hello port forwarder!";
            client.write_all(payload).await.unwrap();

            let mut received = vec![0u8; payload.len()];
            timeout(TEST_TIMEOUT, client.read_exact(&mut received))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, payload);
        }

        #[tokio::test]
        async fn half_close_still_receives_reply() {
            let echo_port = start_echo_server().await;
            let (proxy_port, task) = start_forwarder(echo_port).await;

            let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
            let payload = vec![0xAB; 64 * 1024];
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();

            let mut received = Vec::new();
            timeout(TEST_TIMEOUT, client.read_to_end(&mut received))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, payload);

            let result = timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
            assert!(result.is_ok());
        }

        #[tokio::test]
        async fn target_close_closes_client() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let target_port = listener.local_addr().unwrap().port();
            tokio::spawn(async move {
                if let Ok((mut stream, _)) = listener.accept().await {
                    let _ = stream.write_all(b"bye").await;
                }
            });

            let (proxy_port, _) = start_forwarder(target_port).await;
            let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();

            let mut received = Vec::new();
            timeout(TEST_TIMEOUT, client.read_to_end(&mut received))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, b"bye");
        }

        #[tokio::test]
        async fn dial_failure_closes_accepted_connection() {
            let unreachable_port = find_free_port().await;
            let (proxy_port, task) = start_forwarder(unreachable_port).await;

            let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
            let result = timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
            assert!(result.is_err());

            let mut buffer = [0u8; 16];
            let read = timeout(TEST_TIMEOUT, client.read(&mut buffer)).await.unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));
        }
    }

    mod udp {
        use super::*;

        #[tokio::test]
        async fn sends_exact_payload_from_listener_socket() {
            let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let target_port = target.local_addr().unwrap().port();
            let proxy = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let route = Route::new("127.0.0.1", target_port, Protocol::Udp).unwrap();
            let source: SocketAddr = "127.0.0.1:40000".parse().unwrap();

            let payload = vec![0x5A; 1500];
            forward_datagram(&proxy, &payload, source, &route)
                .await
                .unwrap();

            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
            let (n, from) = timeout(TEST_TIMEOUT, target.recv_from(&mut buffer))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buffer[..n], payload.as_slice());
            assert_eq!(from, proxy.local_addr().unwrap());
        }

        #[tokio::test]
        async fn unresolvable_target_is_an_error() {
            let proxy = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let route = Route::new("host.invalid", 53, Protocol::Udp).unwrap();
            let source: SocketAddr = "127.0.0.1:40000".parse().unwrap();

            let result = forward_datagram(&proxy, b"query", source, &route).await;
            assert!(result.is_err());
        }
    }
}
