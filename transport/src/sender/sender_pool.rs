use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tracing::{debug, trace, warn};
use crate::buffers::atomic_map::AtomicMap;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::member::Member;
use crate::sender::data_sender::DataSender;
use crate::sender::sender_state::{SenderState, SenderStates};
use crate::sender::tcp_sender::TcpSender;
use crate::shutdown::Shutdown;

pub type SenderFactory = Arc<dyn Fn(Member) -> Box<dyn DataSender> + Send + Sync>;

/// A bounded pool of senders to a single member. Every sender is handed out to at most one
///  caller at a time, and the pool's size bounds the number of concurrent sends to the member.
///
/// Senders are created lazily, and they are kept (connected) after use. Closing the pool aborts
///  in-flight sends and disconnects all senders.
pub struct SenderPool {
    member: Member,
    config: Arc<TransportConfig>,
    idle: Mutex<Vec<Box<dyn DataSender>>>,
    permits: Arc<Semaphore>,
    shutdown: Shutdown,
    factory: SenderFactory,
    num_created: AtomicUsize,
}

impl SenderPool {
    pub fn new(member: Member, config: Arc<TransportConfig>, factory: SenderFactory) -> SenderPool {
        let permits = Arc::new(Semaphore::new(config.max_senders_per_member));
        SenderPool {
            member,
            config,
            idle: Default::default(),
            permits,
            shutdown: Shutdown::new(),
            factory,
            num_created: AtomicUsize::new(0),
        }
    }

    pub fn member(&self) -> Member {
        self.member
    }

    /// Waits up to the configured pool wait timeout for a sender to become available.
    pub async fn get_sender(self: &Arc<Self>) -> Result<PooledSender, TransportError> {
        let waited = self.config.pool_wait_timeout;
        let permit = match time::timeout(waited, self.permits.clone().acquire_owned()).await {
            Err(_) => {
                warn!("all {} senders to {:?} are busy", self.config.max_senders_per_member, self.member);
                return Err(TransportError::PoolExhausted { member: self.member, waited });
            }
            Ok(Err(_)) => return Err(TransportError::MemberDisappeared(self.member)),
            Ok(Ok(permit)) => permit,
        };
        if self.is_closed() {
            return Err(TransportError::MemberDisappeared(self.member));
        }

        let pooled = self.lock_idle().pop();
        let mut sender = match pooled {
            Some(sender) => {
                trace!("reusing sender to {:?}", self.member);
                sender
            }
            None => {
                let n = self.num_created.fetch_add(1, Ordering::AcqRel) + 1;
                debug!("creating sender #{} to {:?}", n, self.member);
                (self.factory)(self.member)
            }
        };
        sender.keepalive();

        Ok(PooledSender {
            sender: Some(sender),
            pool: self.clone(),
            in_flight: false,
            _permit: permit,
        })
    }

    fn return_sender(&self, mut sender: Box<dyn DataSender>) {
        let mut idle = self.lock_idle();
        if self.is_closed() {
            drop(idle);
            sender.disconnect();
            return;
        }
        idle.push(sender);
    }

    /// Rejects further requests for senders, aborts sends that are in flight, and disconnects
    ///  idle senders. Senders that are currently in use are disconnected when they are returned.
    pub fn close(&self) {
        debug!("closing sender pool for {:?}", self.member);

        // closed under the idle lock, so a concurrently returned sender is either taken here or sees the closed pool
        let idle = {
            let mut idle = self.lock_idle();
            self.permits.close();
            self.shutdown.trigger();
            std::mem::take(&mut *idle)
        };
        for mut sender in idle {
            sender.disconnect();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_triggered()
    }

    pub fn check_keep_alive(&self) {
        for sender in self.lock_idle().iter_mut() {
            sender.keepalive();
        }
    }

    pub fn num_idle(&self) -> usize {
        self.lock_idle().len()
    }

    pub fn num_available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn num_created(&self) -> usize {
        self.num_created.load(Ordering::Acquire)
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<Box<dyn DataSender>>> {
        self.idle.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive use of a pooled sender. The sender goes back to its pool when this is dropped.
///
/// If a send is cancelled (i.e. its future is dropped before completion), the connection may
///  hold part of a frame or an unread ack. The sender is disconnected before it goes back to the
///  pool in that case, so the next send starts on a fresh connection.
pub struct PooledSender {
    sender: Option<Box<dyn DataSender>>,
    pool: Arc<SenderPool>,
    in_flight: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledSender {
    pub fn destination(&self) -> Member {
        self.pool.member
    }

    pub async fn send_message(&mut self, data: &[u8], wait_for_ack: bool) -> Result<(), TransportError> {
        let member = self.pool.member;
        let mut shutdown = self.pool.shutdown.subscribe();
        let Some(sender) = self.sender.as_mut() else {
            return Err(TransportError::MemberDisappeared(member));
        };

        self.in_flight = true;
        let outcome = tokio::select! {
            result = sender.send_message(data, wait_for_ack) => Some(result),
            _ = shutdown.wait() => None,
        };
        self.in_flight = false;

        match outcome {
            Some(result) => result,
            None => {
                debug!("sender pool for {:?} was closed while sending", member);
                sender.disconnect();
                Err(TransportError::MemberDisappeared(member))
            }
        }
    }
}

impl Drop for PooledSender {
    fn drop(&mut self) {
        if let Some(mut sender) = self.sender.take() {
            if self.in_flight {
                debug!("send to {:?} was cancelled, discarding its connection", self.pool.member);
                sender.disconnect();
            }
            self.pool.return_sender(sender);
        }
    }
}

/// The sender pools of all members a node replicates to, together with the members' sender
///  states.
pub struct SenderPoolManager {
    config: Arc<TransportConfig>,
    states: Arc<SenderStates>,
    pools: AtomicMap<Member, Arc<SenderPool>>,
    factory: SenderFactory,
}

impl SenderPoolManager {
    pub fn new(config: Arc<TransportConfig>) -> SenderPoolManager {
        let states = Arc::new(SenderStates::new());

        let factory_config = config.clone();
        let factory_states = states.clone();
        let factory: SenderFactory = Arc::new(move |member: Member| -> Box<dyn DataSender> {
            Box::new(TcpSender::new(member, factory_config.clone(), factory_states.clone()))
        });

        SenderPoolManager {
            config,
            states,
            pools: AtomicMap::new(),
            factory,
        }
    }

    pub fn with_sender_factory(config: Arc<TransportConfig>, factory: SenderFactory) -> SenderPoolManager {
        SenderPoolManager {
            config,
            states: Arc::new(SenderStates::new()),
            pools: AtomicMap::new(),
            factory,
        }
    }

    pub fn pool_for(&self, member: Member) -> Arc<SenderPool> {
        self.pools.get_or_insert_with(member, || {
            Arc::new(SenderPool::new(member, self.config.clone(), self.factory.clone()))
        })
    }

    pub fn member_added(&self, member: Member) {
        debug!("member added: {:?}", member);
        self.pool_for(member);
    }

    /// Closes the member's pool (aborting sends that are in flight) and forgets its state
    pub fn member_disappeared(&self, member: &Member) {
        debug!("member disappeared: {:?}", member);
        if let Some(pool) = self.pools.remove(member) {
            pool.close();
        }
        self.states.remove(member);
    }

    pub fn sender_state(&self, member: &Member) -> SenderState {
        self.states.get(member)
    }

    pub fn members(&self) -> Vec<Member> {
        self.pools.snapshot()
            .keys()
            .copied()
            .collect()
    }

    pub fn check_keep_alive(&self) {
        for pool in self.pools.snapshot().values() {
            pool.check_keep_alive();
        }
    }

    pub fn close(&self) {
        for pool in self.pools.clear().values() {
            pool.close();
        }
    }
}
