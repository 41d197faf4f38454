//! TCP socket options for the broker connection.

use std::{io, time::Duration};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpSocket;

/// Socket options applied before connecting to the broker.
///
/// Options left unset keep the operating system defaults.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use mqttot::transport::SocketOptions;
///
/// let options = SocketOptions::default()
///     .nodelay(true)
///     .keepalive(Some(Duration::from_secs(30)));
/// assert_ne!(options, SocketOptions::default());
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketOptions {
    nodelay: Option<bool>,
    keepalive: Option<Toggle>,
    linger: Option<Toggle>,
    send_buffer_size: Option<u32>,
    recv_buffer_size: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Toggle {
    Disabled,
    Duration(Duration),
}

impl Toggle {
    fn from_option(value: Option<Duration>) -> Self { value.map_or(Self::Disabled, Self::Duration) }

    const fn to_option(self) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::Duration(value) => Some(value),
        }
    }
}

impl SocketOptions {
    /// Configure `TCP_NODELAY`.
    #[must_use]
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = Some(enabled);
        self
    }

    /// Configure `SO_KEEPALIVE`; `None` disables it.
    #[must_use]
    pub fn keepalive(mut self, duration: Option<Duration>) -> Self {
        self.keepalive = Some(Toggle::from_option(duration));
        self
    }

    /// Configure `SO_LINGER`; `None` disables it.
    #[must_use]
    pub fn linger(mut self, duration: Option<Duration>) -> Self {
        self.linger = Some(Toggle::from_option(duration));
        self
    }

    /// Configure the socket send buffer size.
    #[must_use]
    pub fn send_buffer_size(mut self, size: u32) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Configure the socket receive buffer size.
    #[must_use]
    pub fn recv_buffer_size(mut self, size: u32) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    pub(crate) fn apply(&self, socket: &TcpSocket) -> io::Result<()> {
        if let Some(enabled) = self.nodelay {
            socket.set_nodelay(enabled)?;
        }
        if let Some(keepalive) = self.keepalive {
            match keepalive.to_option() {
                Some(duration) => {
                    socket.set_keepalive(true)?;
                    SockRef::from(socket).set_tcp_keepalive(&TcpKeepalive::new().with_time(duration))?;
                }
                None => socket.set_keepalive(false)?,
            }
        }
        if let Some(linger) = self.linger {
            socket.set_linger(linger.to_option())?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn options_are_applied_to_socket() {
        let socket = TcpSocket::new_v4().expect("socket");
        SocketOptions::default()
            .nodelay(true)
            .keepalive(Some(Duration::from_secs(30)))
            .apply(&socket)
            .expect("apply");
        assert!(socket.nodelay().expect("nodelay"));
        assert!(socket.keepalive().expect("keepalive"));
    }

    #[test]
    fn builders_are_independent() {
        let a = SocketOptions::default().linger(None);
        let b = SocketOptions::default().linger(Some(Duration::from_secs(1)));
        assert_ne!(a, b);
    }
}
