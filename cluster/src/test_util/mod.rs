use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time;
use transport::channel_message::ChannelMessage;
use crate::channel::channel_listener::ChannelListener;

/// Collects the messages it receives. A payload of "fail" is rejected with an error.
#[derive(Default)]
pub struct RecordingListener {
    received: Mutex<Vec<ChannelMessage>>,
    notify: Notify,
}

impl RecordingListener {
    pub fn received(&self) -> Vec<ChannelMessage> {
        self.received.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.received().iter()
            .map(|m| m.payload.to_vec())
            .collect()
    }

    pub async fn wait_for(&self, num_messages: usize) {
        time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.notify.notified();
                if self.received.lock().unwrap().len() >= num_messages {
                    return;
                }
                notified.await;
            }
        }).await
            .unwrap()
    }
}

#[async_trait]
impl ChannelListener for RecordingListener {
    async fn message_received(&self, msg: &ChannelMessage) -> anyhow::Result<()> {
        if msg.payload.as_ref() == b"fail" {
            anyhow::bail!("rejecting message as requested");
        }
        self.received.lock().unwrap().push(msg.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}
