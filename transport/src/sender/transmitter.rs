use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashSet;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use crate::buffers::frame_buffer::FrameBuffer;
use crate::channel_message::{ChannelMessage, SendOptions};
use crate::config::TransportConfig;
use crate::error::{ChannelError, TransportError};
use crate::member::Member;
use crate::sender::sender_pool::SenderPoolManager;

/// The sending side of the transport: serializes and frames a message once, and pushes it to all
///  destinations concurrently through their sender pools.
pub struct ReplicationTransmitter {
    config: Arc<TransportConfig>,
    pools: Arc<SenderPoolManager>,
}

impl ReplicationTransmitter {
    pub fn new(config: Arc<TransportConfig>) -> ReplicationTransmitter {
        let pools = Arc::new(SenderPoolManager::new(config.clone()));
        ReplicationTransmitter::with_pool_manager(config, pools)
    }

    pub fn with_pool_manager(config: Arc<TransportConfig>, pools: Arc<SenderPoolManager>) -> ReplicationTransmitter {
        ReplicationTransmitter {
            config,
            pools,
        }
    }

    pub fn pool_manager(&self) -> &Arc<SenderPoolManager> {
        &self.pools
    }

    /// Sends `msg` to every destination, waiting for acks if the message's options ask for them.
    ///
    /// Delivery to one member does not depend on any other member: the call returns after all
    ///  sends completed, and the error lists exactly the members that did not get the message.
    pub async fn send_message(&self, destinations: &[Member], msg: &ChannelMessage) -> Result<(), ChannelError> {
        if destinations.is_empty() {
            return Err(ChannelError::new("no destination members given"));
        }

        let data = match self.frame(msg) {
            Ok(data) => data,
            Err(e) => {
                warn!("unable to send message {}: {}", msg.unique_id, e);
                let mut error = ChannelError::new(format!("unable to send message {}", msg.unique_id));
                for &member in destinations {
                    error.add_faulty_member(member, TransportError::framing(e.to_string()));
                }
                return Err(error);
            }
        };

        let wait_for_ack = msg.options.contains(SendOptions::USE_ACK);
        trace!("sending message {} ({} bytes) to {} members, ack: {:?}", msg.unique_id, data.len(), destinations.len(), msg.options.ack_mode());

        let mut seen = FxHashSet::default();
        let handles: Vec<(Member, JoinHandle<Result<(), TransportError>>)> = destinations.iter()
            .filter(|m| seen.insert(**m))
            .map(|&member| {
                let pools = self.pools.clone();
                let data = data.clone();
                (member, tokio::spawn(async move {
                    send_to_member(&pools, member, &data, wait_for_ack).await
                }))
            })
            .collect();

        let mut error = ChannelError::new(format!("unable to send message {} to all members", msg.unique_id));
        for (member, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!("send task for {:?} failed: {}", member, e);
                    Err(TransportError::Io { addr: member.socket_addr, source: std::io::Error::other(e.to_string()) })
                }
            };
            if let Err(e) = result {
                debug!("sending message {} to {:?} failed: {}", msg.unique_id, member, e);
                error.add_faulty_member(member, e);
            }
        }

        if error.faulty_members().is_empty() {
            Ok(())
        }
        else {
            Err(error)
        }
    }

    fn frame(&self, msg: &ChannelMessage) -> Result<Bytes, TransportError> {
        let len = msg.serialized_len();
        if len > self.config.max_message_size {
            return Err(TransportError::framing(format!("message of {} bytes exceeds the maximum message size of {} bytes", len, self.config.max_message_size)));
        }

        let mut payload = BytesMut::with_capacity(len);
        msg.ser(&mut payload)?;

        let mut buf = BytesMut::with_capacity(FrameBuffer::data_package_len(len));
        FrameBuffer::create_data_package_into(&payload, &mut buf)?;
        Ok(buf.freeze())
    }

    pub fn member_added(&self, member: Member) {
        self.pools.member_added(member);
    }

    pub fn member_disappeared(&self, member: &Member) {
        self.pools.member_disappeared(member);
    }

    pub fn check_keep_alive(&self) {
        self.pools.check_keep_alive();
    }

    pub fn close(&self) {
        debug!("closing transmitter");
        self.pools.close();
    }
}

async fn send_to_member(pools: &SenderPoolManager, member: Member, data: &[u8], wait_for_ack: bool) -> Result<(), TransportError> {
    let pool = pools.pool_for(member);
    let mut sender = pool.get_sender().await?;
    sender.send_message(data, wait_for_ack).await
}
