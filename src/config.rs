use std::time::Duration;
use anyhow::bail;

/// Maximum size of a single datagram; the receive buffer of each streaming connection is sized
///  to this.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Time allowed for a connection attempt (base connect plus TLS / QUIC handshake) before it
    ///  is abandoned with a timeout error.
    ///
    /// This can be changed at runtime through the streaming manager.
    pub connect_timeout: Duration,

    /// Delay before reconnecting after a connection attempt failed or an established connection
    ///  was dropped.
    pub connect_retry_backoff: Duration,

    /// Interval between attempts to resolve an endpoint's host name. Resolution is retried
    ///  indefinitely until it succeeds or the endpoint is removed.
    pub resolve_retry: Duration,

    /// If nothing was received for this long, the connection is considered stale and a ping is
    ///  sent to provoke traffic from the server.
    pub rx_stale: Duration,
    /// While the connection is stale, pings are repeated at this interval
    pub rx_stale_ping_interval: Duration,
    /// If nothing was received for this long, the server is considered unresponsive and the
    ///  connection is reset.
    pub rx_timeout: Duration,

    /// Stale time set on outgoing pings
    pub ping_stale_time: Duration,

    /// Time allowed for protocol negotiation after a connection comes up. If no protocol support
    ///  advertisement arrives in that time, the connection stays in XML mode. If a switch request
    ///  was sent but not answered in that time, the connection is reset.
    pub proto_timeout: Duration,

    /// Turns idle detection (stale pings and rx timeout) on or off. Can be changed at runtime.
    pub monitor: bool,

    /// Capacity of each connection's receive buffer. This is a hard upper bound for the size of
    ///  a single received message.
    pub rx_buffer_size: usize,

    /// upper bound for a single blocking wait of the connection manager thread
    pub conn_select_timeout: Duration,
    /// upper bound for a single blocking wait of the I/O thread
    pub io_select_timeout: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            connect_timeout: Duration::from_secs(20),
            connect_retry_backoff: Duration::from_secs(15),
            resolve_retry: Duration::from_secs(30),
            rx_stale: Duration::from_secs(15),
            rx_stale_ping_interval: Duration::from_millis(4500),
            rx_timeout: Duration::from_secs(25),
            ping_stale_time: Duration::from_secs(10),
            proto_timeout: Duration::from_secs(60),
            monitor: true,
            rx_buffer_size: MAX_DATAGRAM_SIZE,
            conn_select_timeout: Duration::from_millis(500),
            io_select_timeout: Duration::from_millis(100),
        }
    }
}

impl StreamingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rx_buffer_size < 64 {
            bail!("receive buffer size is too small");
        }
        if self.rx_stale >= self.rx_timeout {
            bail!("rx stale threshold must be shorter than the rx timeout");
        }
        if self.rx_stale_ping_interval.is_zero() {
            bail!("stale ping interval must be positive");
        }
        if self.conn_select_timeout.is_zero() || self.io_select_timeout.is_zero() {
            bail!("select timeouts must be positive");
        }
        Ok(())
    }
}
