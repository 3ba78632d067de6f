use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::{select, time};
use tracing::{debug, error, info, warn};
use transport::buffers::atomic_map::AtomicMap;
use transport::channel_message::{ChannelMessage, SendOptions, UniqueId};
use transport::error::ChannelError;
use transport::member::Member;
use transport::message_dispatcher::MessageDispatcher;
use transport::receiver::tcp_receiver::TcpReceiver;
use transport::sender::sender_pool::SenderPoolManager;
use transport::sender::sender_state::SenderState;
use transport::sender::transmitter::ReplicationTransmitter;
use transport::shutdown::{Shutdown, ShutdownListener};
use crate::channel::channel_listener::ChannelListener;
use crate::cluster_config::ClusterConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Default)]
struct ListenerRegistry {
    listeners: AtomicMap<ListenerId, Arc<dyn ChannelListener>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    fn add(&self, listener: Arc<dyn ChannelListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::AcqRel));
        self.listeners.overwrite_entry(id, listener);
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }
}

#[async_trait]
impl MessageDispatcher for ListenerRegistry {
    /// Passes the message to all accepting listeners in registration order. All of them are
    ///  called even if one fails, and the first failure is returned.
    async fn on_message(&self, msg: &ChannelMessage) -> anyhow::Result<()> {
        let snapshot = self.listeners.snapshot();
        let mut listeners = snapshot.iter().collect::<Vec<_>>();
        listeners.sort_by_key(|(id, _)| **id);

        let mut result = Ok(());
        let mut num_accepted = 0;
        for (id, listener) in listeners {
            if !listener.accept(msg) {
                continue;
            }
            num_accepted += 1;

            if let Err(e) = listener.message_received(msg).await {
                warn!("listener {:?} failed to process message {} from {:?}: {}", id, msg.unique_id, msg.address, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        if num_accepted == 0 {
            debug!("no listener accepted message {} from {:?}", msg.unique_id, msg.address);
        }
        result
    }
}

/// A node's endpoint for replication: sends messages to other members and passes received
///  messages to registered listeners.
pub struct ReplicationChannel {
    config: Arc<ClusterConfig>,
    local_member: Member,
    transmitter: ReplicationTransmitter,
    receiver: TcpReceiver,
    listeners: Arc<ListenerRegistry>,
    shutdown: Shutdown,
    keep_alive_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationChannel {
    pub async fn new(config: Arc<ClusterConfig>) -> anyhow::Result<ReplicationChannel> {
        config.validate()?;

        let transport_config = Arc::new(config.transport.clone());
        let listeners = Arc::new(ListenerRegistry::default());
        let receiver = TcpReceiver::bind(transport_config.clone(), listeners.clone()).await?;
        let local_member = config.local_member(receiver.local_addr());

        debug!("local member is {:?}", local_member);

        Ok(ReplicationChannel {
            local_member,
            transmitter: ReplicationTransmitter::new(transport_config),
            receiver,
            listeners,
            shutdown: Shutdown::new(),
            keep_alive_handle: Default::default(),
            config,
        })
    }

    pub fn local_member(&self) -> Member {
        self.local_member
    }

    /// Starts accepting connections from other members and the periodic keep-alive check
    pub fn start(&self) {
        info!("starting replication channel for {:?}", self.local_member);
        self.receiver.start();

        let mut handle = self.keep_alive_handle.lock()
            .unwrap_or_else(PoisonError::into_inner);
        if handle.is_none() {
            *handle = Some(tokio::spawn(run_keep_alive_checks(
                self.config.clone(),
                self.transmitter.pool_manager().clone(),
                self.shutdown.subscribe(),
            )));
        }
    }

    /// Stops receiving and closes all outbound connections. Sends that are in flight fail.
    pub async fn stop(&self) {
        info!("stopping replication channel for {:?}", self.local_member);
        self.shutdown.trigger();

        let handle = self.keep_alive_handle.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("keep-alive task failed: {}", e);
            }
        }

        self.receiver.stop().await;
        self.transmitter.close();
    }

    /// Sends `payload` to all `destinations`, returning the message's unique id. The options
    ///  decide whether (and when) the destinations acknowledge the message.
    pub async fn send(&self, destinations: &[Member], payload: impl Into<Bytes>, options: SendOptions) -> Result<UniqueId, ChannelError> {
        let msg = ChannelMessage::new(self.local_member, options | SendOptions::BYTE_MESSAGE, payload);
        self.transmitter.send_message(destinations, &msg).await?;
        Ok(msg.unique_id)
    }

    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) -> ListenerId {
        let id = self.listeners.add(listener);
        debug!("added listener {:?}", id);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn member_added(&self, member: Member) {
        info!("member added: {:?}", member);
        self.transmitter.member_added(member);
    }

    pub fn member_disappeared(&self, member: &Member) {
        info!("member disappeared: {:?}", member);
        self.transmitter.member_disappeared(member);
    }

    pub fn sender_state(&self, member: &Member) -> SenderState {
        self.transmitter.pool_manager().sender_state(member)
    }

    pub fn receiver(&self) -> &TcpReceiver {
        &self.receiver
    }
}

async fn run_keep_alive_checks(config: Arc<ClusterConfig>, pools: Arc<SenderPoolManager>, mut shutdown: ShutdownListener) {
    let mut ticks = time::interval(config.keep_alive_check_interval);
    loop {
        select! {
            _ = ticks.tick() => pools.check_keep_alive(),
            _ = shutdown.wait() => break,
        }
    }
    debug!("keep-alive checks terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel_listener::MockChannelListener;
    use crate::test_util::RecordingListener;
    use std::net::SocketAddr;
    use std::time::Duration;
    use transport::error::TransportError;

    async fn channel() -> ReplicationChannel {
        let mut config = ClusterConfig::new(SocketAddr::from(([127,0,0,1], 0))).unwrap();
        config.transport.min_threads = 2;
        config.transport.timeout = Duration::from_secs(1);
        let channel = ReplicationChannel::new(Arc::new(config)).await.unwrap();
        channel.start();
        channel
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let a = channel().await;
        let b = channel().await;
        let listener = Arc::new(RecordingListener::default());
        b.add_listener(listener.clone());

        let id_1 = a.send(&[b.local_member()], b"one".to_vec(), SendOptions::sync_ack()).await.unwrap();
        let id_2 = a.send(&[b.local_member()], b"two".to_vec(), SendOptions::sync_ack()).await.unwrap();

        let received = listener.received();
        assert_eq!(listener.payloads(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(received[0].unique_id, id_1);
        assert_eq!(received[1].unique_id, id_2);
        assert_eq!(received[0].address, a.local_member());
        assert!(received[0].options.contains(SendOptions::BYTE_MESSAGE | SendOptions::USE_ACK));
        assert_eq!(a.sender_state(&b.local_member()), SenderState::Ready);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_fire_and_forget() {
        let a = channel().await;
        let b = channel().await;
        let listener = Arc::new(RecordingListener::default());
        b.add_listener(listener.clone());

        a.send(&[b.local_member()], b"x".to_vec(), SendOptions::empty()).await.unwrap();
        listener.wait_for(1).await;

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_listener_failure_is_reported_to_sender() {
        let a = channel().await;
        let b = channel().await;
        b.add_listener(Arc::new(RecordingListener::default()));

        let error = a.send(&[b.local_member()], b"fail".to_vec(), SendOptions::sync_ack()).await.unwrap_err();
        assert!(matches!(error.faulty_member(&b.local_member()), Some(TransportError::RemoteProcessing { .. })));

        a.send(&[b.local_member()], b"fail".to_vec(), SendOptions::async_ack()).await.unwrap();

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_listener_selection() {
        let a = channel().await;
        let b = channel().await;

        let mut rejecting = MockChannelListener::new();
        rejecting.expect_accept().return_const(false);
        rejecting.expect_message_received().never();
        b.add_listener(Arc::new(rejecting));

        let mut accepting = MockChannelListener::new();
        accepting.expect_accept().return_const(true);
        accepting.expect_message_received()
            .times(1)
            .returning(|msg| {
                assert_eq!(msg.payload.as_ref(), b"abc");
                Ok(())
            });
        let accepting_id = b.add_listener(Arc::new(accepting));

        a.send(&[b.local_member()], b"abc".to_vec(), SendOptions::sync_ack()).await.unwrap();

        assert!(b.remove_listener(accepting_id));
        assert!(!b.remove_listener(accepting_id));
        a.send(&[b.local_member()], b"abc".to_vec(), SendOptions::sync_ack()).await.unwrap();

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_partial_failure() {
        let a = channel().await;
        let b = channel().await;
        let c = channel().await;
        let listener = Arc::new(RecordingListener::default());
        b.add_listener(listener.clone());
        c.stop().await;

        let error = a.send(&[b.local_member(), c.local_member()], b"x".to_vec(), SendOptions::sync_ack()).await.unwrap_err();

        assert_eq!(error.faulty_members().len(), 1);
        assert!(error.faulty_member(&c.local_member()).is_some());
        assert_eq!(listener.payloads(), vec![b"x".to_vec()]);
        assert_ne!(a.sender_state(&c.local_member()), SenderState::Ready);

        a.member_disappeared(&c.local_member());
        assert_eq!(a.sender_state(&c.local_member()), SenderState::Ready);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_keep_alive_checks_run() {
        let mut config = ClusterConfig::new(SocketAddr::from(([127,0,0,1], 0))).unwrap();
        config.keep_alive_check_interval = Duration::from_millis(20);
        config.transport.keep_alive_time = Some(Duration::from_millis(10));
        let a = ReplicationChannel::new(Arc::new(config)).await.unwrap();
        a.start();
        let b = channel().await;

        a.send(&[b.local_member()], b"x".to_vec(), SendOptions::sync_ack()).await.unwrap();
        let pool = a.transmitter.pool_manager().pool_for(b.local_member());
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(b.receiver().worker_pool().active_workers(), 1);

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(b.receiver().worker_pool().active_workers(), 0);

        a.send(&[b.local_member()], b"y".to_vec(), SendOptions::sync_ack()).await.unwrap();
        assert_eq!(pool.num_created(), 1);

        a.stop().await;
        b.stop().await;
    }
}
