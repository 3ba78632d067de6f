//! A reliable point-to-point message transport for replicating state between cluster nodes.
//!
//! The transport is connection oriented: a node keeps a bounded pool of TCP connections to every
//!  peer it replicates to, and accepts connections from its peers on a single listening socket.
//!  Messages travel as length-prefixed frames, and the sender can optionally wait for an
//!  acknowledgement that the receiver decoded (and, depending on the ack mode, processed) the
//!  message.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (`ChannelMessage`), not streams of bytes
//! * Delivery to one peer is reliable as far as TCP is: a failed write or a missing / invalid
//!    acknowledgement triggers a reconnect and a bounded number of retries
//! * A hung peer must never block a sender indefinitely - every connect, write and ack read is
//!    bounded by the configured timeout
//! * Outbound concurrency per peer is bounded by the sender pool, which is the only admission
//!    control point on the sending side
//! * A failing application callback on the receiving side never takes down the connection or the
//!    worker that drives it
//! * There is no ordering guarantee across different pooled connections to the same peer. If
//!    ordering matters, configure `max_senders_per_member = 1`
//!
//! ## Frame
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//!  0: start marker (7 bytes, ASCII "FLT2002")
//!  7: payload length (u32)
//! 11: payload (serialized ChannelMessage)
//!  *: end marker (7 bytes, ASCII "TLF2003")
//! ```
//!
//! The markers allow the receiver to detect a peer that is out of sync with the framing (or is
//!  not speaking this protocol at all) as early as possible, closing the connection instead of
//!  interpreting garbage as a length.
//!
//! ## Channel message
//!
//! ```ascii
//!  0: options (u32) - see `SendOptions`
//!  4: timestamp (u64) - millis since epoch at the sending node
//! 12: unique id (16 bytes)
//! 28: source member (variable length, see `Member`)
//!  *: payload length (u32)
//!  *: payload
//! ```
//!
//! ## Acknowledgement
//!
//! Acks are sent as plain (unframed) 3-byte sequences on the same connection:
//!
//! ```ascii
//! ACK       06 02 03
//! FAIL_ACK  0B 00 05
//! ```
//!
//! Whether an ack is sent and when is decided by the sender through the message's options:
//! * no `USE_ACK`: no ack is sent, the sender does not wait
//! * `USE_ACK` without `SYNCHRONIZED_ACK` ('async ack'): the receiver sends ACK as soon as the
//!    message is decoded, before the application callback runs
//! * `USE_ACK | SYNCHRONIZED_ACK` ('sync ack'): the receiver sends ACK or FAIL_ACK after the
//!    application callback returned, depending on its outcome

pub mod ack;
pub mod buffers;
pub mod channel_message;
pub mod config;
pub mod error;
pub mod member;
pub mod message_dispatcher;
pub mod receiver;
pub mod sender;
pub mod shutdown;
pub mod socket_options;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
