//! Session-wide listener for incoming peer connections.
//!
//! Accepted sockets have their handshake read here so the stream can be
//! routed to the coordinator of the torrent it asks for.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use super::commands::InternalEvent;
use crate::torrent::TorrentError;
use crate::torrent::protocol::read_handshake;

/// Binds the listener on all interfaces.
///
/// # Errors
/// - `TorrentError::Io` - Port unavailable
pub(crate) async fn bind(port: u16) -> Result<TcpListener, TorrentError> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    Ok(listener)
}

/// Accepts connections until the session stops listening.
pub(crate) async fn run_listener(
    listener: TcpListener,
    events: mpsc::UnboundedSender<InternalEvent>,
    handshake_timeout: Duration,
) {
    loop {
        let (mut stream, endpoint) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept peer connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if events.is_closed() {
            break;
        }

        let events = events.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(handshake_timeout, read_handshake(&mut stream)).await {
                Ok(Ok(handshake)) => {
                    let _ = events.send(InternalEvent::Incoming {
                        endpoint,
                        stream,
                        handshake,
                    });
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer = %endpoint, error = %e, "Incoming handshake rejected")
                }
                Err(_) => tracing::debug!(peer = %endpoint, "Incoming handshake timed out"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpStream;

    use super::*;
    use crate::torrent::protocol::write_handshake;
    use crate::torrent::{InfoHash, PeerHandshake, PeerId};

    #[tokio::test]
    async fn test_routes_handshaken_streams() {
        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_listener(listener, tx, Duration::from_secs(2)));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let handshake = PeerHandshake::new(InfoHash::new([5; 20]), PeerId::new([6; 20]));
        write_handshake(&mut stream, &handshake).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            InternalEvent::Incoming { handshake: got, .. } => {
                assert_eq!(got.info_hash, InfoHash::new([5; 20]));
                assert_eq!(got.peer_id, PeerId::new([6; 20]));
            }
            _ => panic!("expected an incoming connection"),
        }
        task.abort();
    }
}
