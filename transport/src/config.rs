use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::buffers::frame_buffer::FRAME_OVERHEAD;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// The address the receiver listens on
    pub bind_addr: SocketAddr,
    /// If binding fails because the port is in use, the receiver tries the next port, up to this
    ///  many times. This is intended for running several nodes on a single machine.
    pub auto_bind_attempts: u16,

    /// Upper bound for connecting, for writing a message and for waiting for its ack. A peer that
    ///  does not make progress within this time is treated as failed for the current attempt.
    pub timeout: Duration,

    pub tx_buf_size: usize,
    /// Socket receive buffer size, also used as chunk size when the receiver reads from a socket
    pub rx_buf_size: usize,
    pub tcp_no_delay: bool,
    pub so_keep_alive: bool,
    pub so_linger: Option<Duration>,
    /// IP TOS byte, `None` to leave the OS default
    pub traffic_class: Option<u32>,

    /// The number of retries after the initial attempt failed, so a value of 2 means up to 3
    ///  attempts in total. Every retry is done on a fresh connection.
    pub max_retry_attempts: u32,
    /// Treat a FAIL_ACK as an error (`TransportError::RemoteProcessing`). If this is `false`, a
    ///  FAIL_ACK is logged and otherwise treated as successful delivery.
    pub throw_on_failed_ack: bool,

    /// Maximum number of pooled connections to a single member. This bounds concurrent outbound
    ///  sends per member. A value of 1 guarantees that messages to a member are delivered in the
    ///  order they were sent.
    pub max_senders_per_member: usize,
    /// How long a caller waits for a pooled sender before giving up
    pub pool_wait_timeout: Duration,

    /// Reconnect after this many requests on a connection
    pub keep_alive_count: Option<u64>,
    /// Reconnect when a connection is older than this
    pub keep_alive_time: Option<Duration>,

    /// Receiver worker tasks that are started eagerly
    pub min_threads: usize,
    /// Upper bound for receiver worker tasks, i.e. for connections that are serviced concurrently.
    ///  Connections beyond this are still accepted, and wait for a worker to become available.
    pub max_threads: usize,

    /// Upper bound for the serialized size of a message - this is checked on both sides
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            bind_addr: SocketAddr::from(([0,0,0,0], 4000)),
            auto_bind_attempts: 100,
            timeout: Duration::from_secs(3),
            tx_buf_size: 43800,
            rx_buf_size: 25188,
            tcp_no_delay: true,
            so_keep_alive: true,
            so_linger: None,
            traffic_class: Some(0x04 | 0x08 | 0x10),
            max_retry_attempts: 1,
            throw_on_failed_ack: true,
            max_senders_per_member: 25,
            pool_wait_timeout: Duration::from_secs(3),
            keep_alive_count: None,
            keep_alive_time: None,
            min_threads: 6,
            max_threads: 15,
            max_message_size: 16*1024*1024,
        }
    }
}

impl TransportConfig {
    pub fn new(bind_addr: SocketAddr) -> TransportConfig {
        TransportConfig {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout.is_zero() {
            bail!("timeout must be positive");
        }
        if self.rx_buf_size == 0 || self.tx_buf_size == 0 {
            bail!("socket buffer sizes must be positive");
        }
        if self.max_senders_per_member == 0 {
            bail!("at least one sender per member is required");
        }
        if self.min_threads == 0 {
            bail!("at least one receiver worker is required");
        }
        if self.max_threads < self.min_threads {
            bail!("max_threads ({}) must not be smaller than min_threads ({})", self.max_threads, self.min_threads);
        }
        if self.max_message_size > u32::MAX as usize - FRAME_OVERHEAD {
            bail!("max_message_size must fit into the frame's length field");
        }
        if self.keep_alive_count == Some(0) {
            bail!("keep_alive_count must be positive if present");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::zero_timeout(TransportConfig { timeout: Duration::ZERO, ..Default::default() })]
    #[case::zero_rx_buf(TransportConfig { rx_buf_size: 0, ..Default::default() })]
    #[case::no_senders(TransportConfig { max_senders_per_member: 0, ..Default::default() })]
    #[case::no_workers(TransportConfig { min_threads: 0, ..Default::default() })]
    #[case::max_below_min(TransportConfig { min_threads: 4, max_threads: 3, ..Default::default() })]
    #[case::huge_messages(TransportConfig { max_message_size: u32::MAX as usize, ..Default::default() })]
    #[case::zero_keep_alive_count(TransportConfig { keep_alive_count: Some(0), ..Default::default() })]
    fn test_invalid(#[case] config: TransportConfig) {
        assert!(config.validate().is_err());
    }
}
