//! Peer heartbeat channel
//!
//! Each replica publishes its FSM state as a decimal code in a single UDP
//! datagram once per heartbeat interval, and listens on the same socket for
//! the peer's state. The channel is independent of the sensor-facing TCP
//! listener.

use crate::common::{Error, Result};
use crate::node::fsm::State;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

const MAX_DATAGRAM: usize = 64;

pub struct HeartbeatBus {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl HeartbeatBus {
    pub async fn bind(local: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self { socket, peer })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Publish our state to the peer.
    pub async fn publish(&self, state: State) -> Result<()> {
        let payload = encode(state);
        self.socket.send_to(payload.as_bytes(), self.peer).await?;
        Ok(())
    }

    /// Wait for the next datagram. Datagrams from anyone but the configured
    /// peer, and malformed payloads, yield `Ok(None)`.
    pub async fn recv(&mut self) -> Result<Option<State>> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        if from != self.peer {
            tracing::warn!("Ignoring heartbeat from {}, peer is {}", from, self.peer);
            return Ok(None);
        }
        match decode(&buf[..len]) {
            Ok(state) => {
                tracing::trace!("Peer heartbeat: {}", state);
                Ok(Some(state))
            }
            Err(e) => {
                tracing::warn!("Dropping heartbeat from {}: {}", from, e);
                Ok(None)
            }
        }
    }
}

pub fn encode(state: State) -> String {
    state.code().to_string()
}

pub fn decode(payload: &[u8]) -> Result<State> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| Error::Malformed("heartbeat is not UTF-8".into()))?;
    let code: u8 = text
        .trim()
        .parse()
        .map_err(|_| Error::Malformed(format!("heartbeat is not a state code: {:?}", text)))?;
    State::from_code(code)
        .ok_or_else(|| Error::Malformed(format!("unknown state code: {}", code)))
}
