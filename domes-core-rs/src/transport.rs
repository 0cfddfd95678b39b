//! Frame transport
//!
//! The core only needs fire-and-forget unicast and broadcast plus an inbound
//! path that decodes frames and enqueues them for the coordination task.
//! `UdpTransport` stands in for the 2.4 GHz radio on a LAN: pod addresses are
//! learned from received frames, broadcasts go to a configured target list.

use crate::codec::{Message, MAX_FRAME_SIZE};
use crate::error::TransportError;
use crate::session::PodInput;
use crate::types::PodAddr;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Default UDP port for pod frames
pub const DEFAULT_PORT: u16 = 9870;

/// Send side of a pod's link. Sends never block.
pub trait Transport: Send + Sync {
    fn own_address(&self) -> PodAddr;

    fn send(&self, to: PodAddr, frame: &[u8]) -> Result<(), TransportError>;

    fn broadcast(&self, frame: &[u8]) -> Result<(), TransportError>;
}

/// UDP transport for pod frames
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    own: PodAddr,
    broadcast_targets: Vec<SocketAddr>,
    /// Pod address → socket address, learned from inbound frames
    routes: Arc<RwLock<HashMap<PodAddr, SocketAddr>>>,
}

impl UdpTransport {
    /// Bind to `port` on all interfaces with broadcast enabled.
    ///
    /// An empty `broadcast_targets` means the limited broadcast address on
    /// the same port.
    pub async fn bind(
        own: PodAddr,
        port: u16,
        broadcast_targets: Vec<SocketAddr>,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        socket.set_broadcast(true)?;

        let broadcast_targets = if broadcast_targets.is_empty() {
            vec![SocketAddr::from(([255, 255, 255, 255], port))]
        } else {
            broadcast_targets
        };

        Ok(Self {
            socket: Arc::new(socket),
            own,
            broadcast_targets,
            routes: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Add a route by hand (e.g. a statically configured peer)
    pub fn add_route(&self, pod: PodAddr, addr: SocketAddr) {
        self.routes.write().insert(pod, addr);
    }

    pub fn route(&self, pod: &PodAddr) -> Option<SocketAddr> {
        self.routes.read().get(pod).copied()
    }

    /// Start the receive task. It only decodes and enqueues; it never
    /// touches coordination state.
    pub fn start_receive(&self, inbox: mpsc::UnboundedSender<PodInput>) {
        let socket = self.socket.clone();
        let routes = self.routes.clone();
        let own = self.own;

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME_SIZE + 1];

            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        let input = match Message::decode(&buf[..len]) {
                            Ok(msg) => {
                                if msg.sender() == own {
                                    continue;
                                }
                                routes.write().insert(msg.sender(), src);
                                debug!("Transport: {} from {} ({})", msg.msg_type().name(), msg.sender(), src);
                                PodInput::Frame(msg)
                            }
                            Err(e) => {
                                warn!("Transport: Undecodable frame from {}: {}", src, e);
                                PodInput::Malformed(e)
                            }
                        };
                        if inbox.send(input).is_err() {
                            debug!("Transport: Inbox closed, stopping receive task");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Transport: UDP receive error: {}", e);
                    }
                }
            }
        });
    }

    fn send_to(&self, frame: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        self.socket.try_send_to(frame, addr)?;
        Ok(())
    }
}

impl Transport for UdpTransport {
    fn own_address(&self) -> PodAddr {
        self.own
    }

    fn send(&self, to: PodAddr, frame: &[u8]) -> Result<(), TransportError> {
        let addr = self
            .route(&to)
            .ok_or_else(|| TransportError::UnknownPeer(to.to_string()))?;
        self.send_to(frame, addr)
    }

    fn broadcast(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut last_err = None;
        for addr in &self.broadcast_targets {
            if let Err(e) = self.send_to(frame, *addr) {
                warn!("Transport: Broadcast to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) if self.broadcast_targets.len() == 1 => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Payload;
    use std::time::Duration;

    async fn loopback(name: &str) -> UdpTransport {
        // port 0: let the OS pick
        UdpTransport::bind(PodAddr::from_name(name), 0, vec![]).await.unwrap()
    }

    #[tokio::test]
    async fn test_unknown_peer_is_an_error() {
        let transport = loopback("a").await;
        let err = transport.send(PodAddr::from_name("b"), &[0u8; 14]).unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_refused() {
        let transport = loopback("a").await;
        let local = transport.local_addr().unwrap();
        transport.add_route(PodAddr::from_name("b"), local);
        let err = transport
            .send(PodAddr::from_name("b"), &[0u8; MAX_FRAME_SIZE + 1])
            .unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn test_frames_reach_inbox_and_routes_are_learned() {
        let a = loopback("a").await;
        let b = loopback("b").await;
        let b_port = b.local_addr().unwrap().port();
        let a_port = a.local_addr().unwrap().port();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.start_receive(tx);

        a.add_route(b.own_address(), SocketAddr::from(([127, 0, 0, 1], b_port)));
        let frame = Message::new(a.own_address(), 3, 0, Payload::StopAll)
            .encode()
            .unwrap();
        a.send(b.own_address(), &frame).unwrap();

        let input = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match input {
            PodInput::Frame(msg) => assert_eq!(msg.sender(), a.own_address()),
            other => panic!("Unexpected input {:?}", other),
        }
        assert_eq!(b.route(&a.own_address()).map(|s| s.port()), Some(a_port));

        // garbage is reported, not dropped silently
        a.send(b.own_address(), &[0xFF; 3]).unwrap();
        let input = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(input, PodInput::Malformed(_)));
    }
}
