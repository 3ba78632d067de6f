use std::io;
use socket2::SockRef;
use tracing::debug;
use crate::config::TransportConfig;

/// Applies the configured socket tuning. This is done for outgoing sockets before they connect
///  and for accepted sockets before the first read, so that blocking behavior is bounded from the
///  first byte on.
///
/// Failing to set the traffic class is not an error: IPv6 sockets reject IP_TOS on some
///  platforms.
pub fn apply_socket_options(socket: SockRef<'_>, config: &TransportConfig) -> io::Result<()> {
    socket.set_send_buffer_size(config.tx_buf_size)?;
    socket.set_recv_buffer_size(config.rx_buf_size)?;
    socket.set_nodelay(config.tcp_no_delay)?;
    socket.set_keepalive(config.so_keep_alive)?;
    socket.set_linger(config.so_linger)?;

    if let Some(traffic_class) = config.traffic_class {
        if let Err(e) = socket.set_tos(traffic_class) {
            debug!("unable to set traffic class {:#x}: {}", traffic_class, e);
        }
    }
    Ok(())
}
