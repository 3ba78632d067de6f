use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::error::TransportError;
use crate::member::Member;

/// A connection to a single member that pushes pre-framed messages. Implementations are driven
///  by one caller at a time - the sender pool hands out each sender exclusively.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataSender: Send + 'static {
    fn destination(&self) -> Member;

    fn is_connected(&self) -> bool;

    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Closes the connection if there is one. Idempotent.
    fn disconnect(&mut self);

    /// Writes `data` (a complete frame), connecting first if necessary, and optionally waits for
    ///  the peer's acknowledgement. Failed attempts are retried on a fresh connection up to the
    ///  configured number of retries.
    async fn send_message(&mut self, data: &[u8], wait_for_ack: bool) -> Result<(), TransportError>;

    /// Drops the connection if it was used for too many requests or is too old. Returns `true`
    ///  if it disconnected.
    fn keepalive(&mut self) -> bool;

    fn request_count(&self) -> u64;
}
