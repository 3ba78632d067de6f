use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time;
use tracing::{debug, trace, warn};
use crate::ack::{AckKind, ACK_LEN};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::member::Member;
use crate::sender::data_sender::DataSender;
use crate::sender::sender_state::SenderStates;
use crate::socket_options::apply_socket_options;

/// A TCP connection to a peer's receiver, used in simplex mode: messages go out, and only acks
///  come back.
pub struct TcpSender {
    destination: Member,
    config: Arc<TransportConfig>,
    states: Arc<SenderStates>,

    stream: Option<TcpStream>,
    connected_at: Option<Instant>,
    requests_on_connection: u64,

    /// every attempt, successful or not, over the sender's lifetime
    request_count: u64,
    /// attempts made by the most recent `send_message` call
    last_attempts: u32,
}

impl TcpSender {
    pub fn new(destination: Member, config: Arc<TransportConfig>, states: Arc<SenderStates>) -> TcpSender {
        TcpSender {
            destination,
            config,
            states,
            stream: None,
            connected_at: None,
            requests_on_connection: 0,
            request_count: 0,
            last_attempts: 0,
        }
    }

    pub fn last_attempts(&self) -> u32 {
        self.last_attempts
    }

    /// A single attempt. With `reconnect`, an existing connection is closed first so the attempt
    ///  never reuses a connection that failed before.
    async fn push_message(&mut self, data: &[u8], reconnect: bool, wait_for_ack: bool) -> Result<(), TransportError> {
        self.request_count += 1;

        if reconnect {
            self.disconnect();
        }
        if !self.is_connected() {
            self.connect().await?;
        }
        self.requests_on_connection += 1;

        let addr = self.destination.socket_addr;
        let timeout = self.config.timeout;
        let throw_on_failed_ack = self.config.throw_on_failed_ack;
        let Some(stream) = self.stream.as_mut() else {
            return Err(TransportError::NotConnected { addr });
        };

        match time::timeout(timeout, stream.write_all(data)).await {
            Err(_) => return Err(TransportError::Timeout { addr, timeout }),
            Ok(Err(source)) => return Err(TransportError::Io { addr, source }),
            Ok(Ok(())) => {}
        }
        trace!("wrote {} bytes to {}", data.len(), addr);

        if wait_for_ack {
            wait_for_ack_bytes(stream, addr, timeout, throw_on_failed_ack).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DataSender for TcpSender {
    fn destination(&self) -> Member {
        self.destination
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        let addr = self.destination.socket_addr;
        let connect_err = |source: io::Error| TransportError::Connect { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(connect_err)?;
        apply_socket_options(SockRef::from(&socket), &self.config)
            .map_err(connect_err)?;
        socket.set_nonblocking(true)
            .map_err(connect_err)?;
        let socket = TcpSocket::from_std_stream(socket.into());

        let stream = match time::timeout(self.config.timeout, socket.connect(addr)).await {
            Err(_) => return Err(TransportError::Timeout { addr, timeout: self.config.timeout }),
            Ok(result) => result.map_err(connect_err)?,
        };
        debug!("connected to {:?}", self.destination);

        self.stream = Some(stream);
        self.connected_at = Some(Instant::now());
        self.requests_on_connection = 0;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("disconnected from {:?}", self.destination);
        }
        self.connected_at = None;
    }

    async fn send_message(&mut self, data: &[u8], wait_for_ack: bool) -> Result<(), TransportError> {
        self.last_attempts = 1;
        let mut error = match self.push_message(data, false, wait_for_ack).await {
            Ok(()) => {
                self.states.set_ready(self.destination);
                return Ok(());
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        self.states.record_failure(self.destination);
        self.disconnect();

        while self.last_attempts <= self.config.max_retry_attempts {
            debug!("send to {:?} failed ({}), retrying", self.destination, error);
            self.last_attempts += 1;

            match self.push_message(data, true, wait_for_ack).await {
                Ok(()) => {
                    self.states.set_ready(self.destination);
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    self.disconnect();
                    error = e;
                }
            }
        }

        if self.config.max_retry_attempts > 0 {
            self.states.record_failure(self.destination);
        }
        warn!("unable to send message to {:?} after {} attempts: {}", self.destination, self.last_attempts, error);
        Err(TransportError::RetriesExhausted {
            addr: self.destination.socket_addr,
            attempts: self.last_attempts,
            source: Box::new(error),
        })
    }

    fn keepalive(&mut self) -> bool {
        let Some(connected_at) = self.connected_at else {
            return false;
        };

        let count_exceeded = self.config.keep_alive_count
            .map(|max| self.requests_on_connection >= max)
            .unwrap_or(false);
        let time_exceeded = self.config.keep_alive_time
            .map(|max| connected_at.elapsed() >= max)
            .unwrap_or(false);

        if count_exceeded || time_exceeded {
            debug!("keep-alive limit reached for connection to {:?}, disconnecting", self.destination);
            self.disconnect();
            return true;
        }
        false
    }

    fn request_count(&self) -> u64 {
        self.request_count
    }
}

/// Reads exactly one ack sequence. A stream that ends early, or bytes that are neither ACK nor
///  FAIL_ACK, are a framing error: the connection can not be trusted afterwards.
async fn wait_for_ack_bytes(stream: &mut TcpStream, addr: SocketAddr, timeout: Duration, throw_on_failed_ack: bool) -> Result<(), TransportError> {
    let mut buf = [0u8; ACK_LEN];
    match time::timeout(timeout, stream.read_exact(&mut buf)).await {
        Err(_) => return Err(TransportError::Timeout { addr, timeout }),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::framing(format!("connection to {} closed before a complete ack was received", addr)));
        }
        Ok(Err(source)) => return Err(TransportError::Io { addr, source }),
        Ok(Ok(_)) => {}
    }

    match AckKind::parse(&buf) {
        Some(AckKind::Ack) => Ok(()),
        Some(AckKind::FailAck) if throw_on_failed_ack => Err(TransportError::RemoteProcessing { addr }),
        Some(AckKind::FailAck) => {
            warn!("{} failed to process a message - not treated as an error as configured", addr);
            Ok(())
        }
        None => Err(TransportError::framing(format!("received invalid ack {:?} from {}", buf, addr))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ack::{ACK, FAIL_ACK};
    use crate::buffers::frame_buffer::FrameBuffer;
    use crate::sender::sender_state::SenderState;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    #[derive(Clone)]
    pub enum PeerBehavior {
        /// write these bytes after each complete frame
        Respond(Vec<u8>),
        /// read frames, never answer
        Silent,
        /// close every connection right after accepting it
        Close,
    }

    /// A minimal stand-in for a receiver, returning its address and the number of accepted
    ///  connections
    pub async fn spawn_peer(behavior: PeerBehavior) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let accepted_clone = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { return; };
                accepted_clone.fetch_add(1, Ordering::SeqCst);

                let behavior = behavior.clone();
                tokio::spawn(async move {
                    if matches!(behavior, PeerBehavior::Close) {
                        return;
                    }

                    let mut frames = FrameBuffer::new(1024*1024);
                    let mut buf = [0u8; 1024];
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        let count = frames.append(&buf[..n], true).unwrap();
                        for _ in 0..count {
                            frames.extract_data_package(true).unwrap();
                            if let PeerBehavior::Respond(response) = &behavior {
                                if stream.write_all(response).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        (addr, accepted)
    }

    pub async fn unreachable_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn sender(addr: SocketAddr, config: TransportConfig) -> (TcpSender, Arc<SenderStates>) {
        let states = Arc::new(SenderStates::new());
        let sender = TcpSender::new(Member::new(1, addr), Arc::new(config), states.clone());
        (sender, states)
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        FrameBuffer::create_data_package(payload).unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_send_with_ack() {
        let (addr, accepted) = spawn_peer(PeerBehavior::Respond(ACK.to_vec())).await;
        let (mut sender, states) = sender(addr, TransportConfig::default());

        sender.send_message(&frame(b"a"), true).await.unwrap();
        sender.send_message(&frame(b"b"), true).await.unwrap();

        assert!(sender.is_connected());
        assert_eq!(sender.last_attempts(), 1);
        assert_eq!(sender.request_count(), 2);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(states.get(&sender.destination()), SenderState::Ready);
    }

    #[tokio::test]
    async fn test_send_without_ack() {
        let (addr, _) = spawn_peer(PeerBehavior::Silent).await;
        let (mut sender, _) = sender(addr, TransportConfig::default());

        sender.send_message(&frame(b"a"), false).await.unwrap();
        assert!(sender.is_connected());
    }

    #[rstest]
    #[case::fail_ack_throws(FAIL_ACK.to_vec(), true, Some(false))]
    #[case::fail_ack_ignored(FAIL_ACK.to_vec(), false, None)]
    #[case::ack(ACK.to_vec(), true, None)]
    #[case::invalid_ack(vec![1,2,3], true, Some(true))]
    #[case::truncated_ack(vec![6,2], true, Some(true))]
    #[tokio::test]
    async fn test_ack_handling(#[case] response: Vec<u8>, #[case] throw_on_failed_ack: bool, #[case] expected_framing_error: Option<bool>) {
        let (addr, _) = spawn_peer(PeerBehavior::Respond(response)).await;
        let (mut sender, _) = sender(addr, TransportConfig {
            throw_on_failed_ack,
            max_retry_attempts: 0,
            timeout: Duration::from_millis(300),
            ..Default::default()
        });

        let result = sender.send_message(&frame(b"payload"), true).await;
        match expected_framing_error {
            None => assert!(result.is_ok()),
            Some(false) => assert!(matches!(result, Err(TransportError::RemoteProcessing { .. }))),
            Some(true) => {
                let error = result.unwrap_err();
                assert!(matches!(error, TransportError::RetriesExhausted { attempts: 1, .. }));
                assert!(matches!(error.root(), TransportError::Framing(_) | TransportError::Timeout { .. }));
            }
        }
    }

    #[rstest]
    #[case::no_retries(0, 1)]
    #[case::one_retry(1, 2)]
    #[case::two_retries(2, 3)]
    #[tokio::test]
    async fn test_retry_bound_on_closed_connections(#[case] max_retry_attempts: u32, #[case] expected_attempts: u32) {
        let (addr, accepted) = spawn_peer(PeerBehavior::Close).await;
        let (mut sender, states) = sender(addr, TransportConfig {
            max_retry_attempts,
            ..Default::default()
        });

        let error = sender.send_message(&frame(b"x"), true).await.unwrap_err();

        assert!(matches!(error, TransportError::RetriesExhausted { attempts, .. } if attempts == expected_attempts));
        assert_eq!(sender.last_attempts(), expected_attempts);
        assert_eq!(accepted.load(Ordering::SeqCst), expected_attempts as usize);
        assert_ne!(states.get(&sender.destination()), SenderState::Ready);
        assert!(!sender.is_connected());
    }

    #[tokio::test]
    async fn test_retry_bound_unreachable() {
        let addr = unreachable_addr().await;
        let (mut sender, states) = sender(addr, TransportConfig {
            max_retry_attempts: 2,
            timeout: Duration::from_secs(1),
            ..Default::default()
        });

        let error = sender.send_message(&frame(b"x"), true).await.unwrap_err();

        match &error {
            TransportError::RetriesExhausted { attempts, source, .. } => {
                assert_eq!(*attempts, 3);
                assert!(matches!(source.as_ref(), TransportError::Connect { .. } | TransportError::Timeout { .. }));
            }
            e => panic!("unexpected error {:?}", e),
        }
        assert_eq!(sender.last_attempts(), 3);
        assert_eq!(sender.request_count(), 3);
        assert_eq!(states.get(&sender.destination()), SenderState::Failing);
    }

    #[tokio::test]
    async fn test_recovers_on_retry() {
        let (addr, accepted) = spawn_peer(PeerBehavior::Respond(ACK.to_vec())).await;
        let (mut sender, states) = sender(addr, TransportConfig {
            max_retry_attempts: 1,
            ..Default::default()
        });
        states.record_failure(sender.destination());

        sender.send_message(&frame(b"a"), true).await.unwrap();
        assert_eq!(states.get(&sender.destination()), SenderState::Ready);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keepalive_count() {
        let (addr, accepted) = spawn_peer(PeerBehavior::Respond(ACK.to_vec())).await;
        let (mut sender, _) = sender(addr, TransportConfig {
            keep_alive_count: Some(2),
            ..Default::default()
        });

        sender.send_message(&frame(b"a"), true).await.unwrap();
        assert!(!sender.keepalive());
        sender.send_message(&frame(b"b"), true).await.unwrap();
        assert!(sender.keepalive());
        assert!(!sender.is_connected());

        sender.send_message(&frame(b"c"), true).await.unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_keepalive_time() {
        let (addr, _) = spawn_peer(PeerBehavior::Respond(ACK.to_vec())).await;
        let (mut sender, _) = sender(addr, TransportConfig {
            keep_alive_time: Some(Duration::from_millis(20)),
            ..Default::default()
        });

        sender.send_message(&frame(b"a"), true).await.unwrap();
        assert!(!sender.keepalive());
        time::sleep(Duration::from_millis(40)).await;
        assert!(sender.keepalive());
    }

    #[tokio::test]
    async fn test_connect_disconnect() {
        let (addr, accepted) = spawn_peer(PeerBehavior::Silent).await;
        let (mut sender, _) = sender(addr, TransportConfig::default());

        assert!(!sender.keepalive());
        sender.connect().await.unwrap();
        sender.connect().await.unwrap();
        assert!(sender.is_connected());

        for _ in 0..100 {
            if accepted.load(Ordering::SeqCst) > 0 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        sender.disconnect();
        sender.disconnect();
        assert!(!sender.is_connected());
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let addr = unreachable_addr().await;
        let (mut sender, _) = sender(addr, TransportConfig::default());

        let error = sender.connect().await.unwrap_err();
        assert!(matches!(error, TransportError::Connect { .. } | TransportError::Timeout { .. }));
        assert!(!sender.is_connected());
    }
}
