//! UDP plumbing towards the network server

use std::io;
use std::time::Duration;

use log::debug;
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub const BACKOFF_MAX: Duration = Duration::from_secs(32);

/// Bind an ephemeral local port and connect it to `host:port`.
pub async fn connect(host: &str, port: u16) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect((host, port)).await?;
    debug!(
        "UDP socket {} connected to {}:{}",
        socket.local_addr()?,
        host,
        port
    );
    Ok(socket)
}

/// Receive one datagram, `None` when nothing arrives within `wait`.
pub async fn recv_timeout(
    socket: &UdpSocket,
    buf: &mut [u8],
    wait: Duration,
) -> io::Result<Option<usize>> {
    match timeout(wait, socket.recv(buf)).await {
        Ok(Ok(n)) => Ok(Some(n)),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(None),
    }
}

/// 1, 2, 4 ... 32 seconds
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            next: Duration::from_secs(1),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(BACKOFF_MAX);
        delay
    }

    pub fn reset(&mut self) {
        self.next = Duration::from_secs(1);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
