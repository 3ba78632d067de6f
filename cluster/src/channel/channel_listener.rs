use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use transport::channel_message::ChannelMessage;

/// Application side of a replication channel. A message is passed to every registered listener
///  that accepts it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelListener: Send + Sync + 'static {
    /// Allows listeners to share a channel, each handling its own kind of message
    fn accept(&self, _msg: &ChannelMessage) -> bool {
        true
    }

    /// An error is reported back to the sender as FAIL_ACK if the message was sent with sync ack
    async fn message_received(&self, msg: &ChannelMessage) -> anyhow::Result<()>;
}
