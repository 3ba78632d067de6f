use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::channel_message::ChannelMessage;

/// The receiving side's callback: it applies a replicated message.
///
/// The outcome determines the acknowledgement for messages sent with sync ack: `Ok` results in
///  ACK, an error (or a panic) in FAIL_ACK. Errors never close the connection the message
///  arrived on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, msg: &ChannelMessage) -> anyhow::Result<()>;
}
