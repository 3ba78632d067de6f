use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};
use crate::ack::AckKind;
use crate::channel_message::{AckMode, ChannelMessage};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::message_dispatcher::MessageDispatcher;
use crate::receiver::message_reader::MessageReader;
use crate::shutdown::{Shutdown, ShutdownListener};

/// An accepted connection waiting to be serviced, together with its (fresh) receive buffer
pub struct ReceiveTask {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub reader: MessageReader,
}

impl ReceiveTask {
    pub fn new(stream: TcpStream, peer: SocketAddr, config: &TransportConfig) -> ReceiveTask {
        ReceiveTask {
            stream,
            peer,
            reader: MessageReader::new(config.max_message_size, config.rx_buf_size),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// waiting for a connection
    Idle,
    /// servicing a connection until it is closed
    Draining,
    Terminated,
}

struct Shared {
    config: Arc<TransportConfig>,
    dispatcher: Arc<dyn MessageDispatcher>,
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReceiveTask>>,
    states: Mutex<Vec<WorkerState>>,
    queued: AtomicUsize,
    shutdown: Shutdown,
}

impl Shared {
    fn lock_states(&self) -> MutexGuard<'_, Vec<WorkerState>> {
        self.states.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, worker_id: usize, state: WorkerState) {
        if let Some(s) = self.lock_states().get_mut(worker_id) {
            *s = state;
        }
    }
}

/// Workers that service accepted connections, one connection per worker at a time.
///
/// Connections are handed over through a queue: a connection that arrives while all workers are
///  busy waits in the queue until a worker becomes idle. The pool starts with `min_threads`
///  workers and adds workers up to `max_threads` when connections are queued and no worker is
///  idle.
pub struct WorkerPool {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<ReceiveTask>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: Arc<TransportConfig>, dispatcher: Arc<dyn MessageDispatcher>) -> WorkerPool {
        let (tx, rx) = mpsc::unbounded_channel();
        let min_threads = config.min_threads;

        let pool = WorkerPool {
            shared: Arc::new(Shared {
                config,
                dispatcher,
                queue: tokio::sync::Mutex::new(rx),
                states: Default::default(),
                queued: AtomicUsize::new(0),
                shutdown: Shutdown::new(),
            }),
            tx,
            handles: Default::default(),
        };

        for _ in 0..min_threads {
            pool.spawn_worker();
        }
        pool
    }

    fn spawn_worker(&self) {
        let worker_id = {
            let mut states = self.shared.lock_states();
            states.push(WorkerState::Idle);
            states.len() - 1
        };
        debug!("starting receive worker #{}", worker_id);

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            run_worker(shared, worker_id).await;
        });
        self.lock_handles().push(handle);
    }

    /// Queues an accepted connection. This never blocks and never rejects a connection because
    ///  of missing workers.
    pub fn submit(&self, task: ReceiveTask) {
        if self.shared.shutdown.is_triggered() {
            debug!("worker pool is shutting down, closing connection from {}", task.peer);
            return;
        }

        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(task)) = self.tx.send(task) {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            warn!("no worker available to service connection from {}", task.peer);
            return;
        }

        if self.idle_workers() == 0 && self.num_workers() < self.shared.config.max_threads {
            self.spawn_worker();
        }
    }

    /// Workers that are idle and not about to pick up a queued connection
    pub fn idle_workers(&self) -> usize {
        let idle = self.shared.lock_states().iter()
            .filter(|s| **s == WorkerState::Idle)
            .count();
        idle.saturating_sub(self.queued())
    }

    pub fn active_workers(&self) -> usize {
        self.count_in_state(WorkerState::Draining)
    }

    /// Connections that were accepted and are waiting for a worker
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub fn num_workers(&self) -> usize {
        self.shared.lock_states().iter()
            .filter(|s| **s != WorkerState::Terminated)
            .count()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared.lock_states().clone()
    }

    fn count_in_state(&self, state: WorkerState) -> usize {
        self.shared.lock_states().iter()
            .filter(|s| **s == state)
            .count()
    }

    /// Signals all workers to stop - draining workers close their connections - and waits for
    ///  them to terminate.
    pub async fn shutdown(&self) {
        info!("shutting down receive workers");
        self.shared.shutdown.trigger();

        let handles = std::mem::take(&mut *self.lock_handles());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("receive worker failed: {}", e);
            }
        }
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_worker(shared: Arc<Shared>, worker_id: usize) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let task = tokio::select! {
            task = next_task(&shared) => task,
            _ = shutdown.wait() => None,
        };
        let Some(task) = task else {
            break;
        };
        shared.queued.fetch_sub(1, Ordering::AcqRel);

        shared.set_state(worker_id, WorkerState::Draining);
        drain(&shared, task, shutdown.clone()).await;
        shared.set_state(worker_id, WorkerState::Idle);
    }

    debug!("receive worker #{} terminated", worker_id);
    shared.set_state(worker_id, WorkerState::Terminated);
}

async fn next_task(shared: &Shared) -> Option<ReceiveTask> {
    shared.queue.lock().await
        .recv().await
}

/// Services a connection until the peer closes it, it breaks, it stays silent for longer than
///  `timeout`, or the pool shuts down. Dropping the task at the end closes the connection and
///  discards its buffered bytes.
#[instrument(name = "receive", skip_all, fields(peer = %task.peer))]
async fn drain(shared: &Shared, mut task: ReceiveTask, mut shutdown: ShutdownListener) {
    debug!("servicing connection");
    let mut buf = vec![0u8; shared.config.rx_buf_size];
    let timeout = shared.config.timeout;

    loop {
        let read_result = tokio::select! {
            r = time::timeout(timeout, task.stream.read(&mut buf)) => r,
            _ = shutdown.wait() => {
                debug!("shutting down, closing connection");
                return;
            }
        };

        let n = match read_result {
            Err(_) => {
                debug!("no data within {:?}, closing connection", timeout);
                return;
            }
            Ok(Ok(0)) => {
                debug!("connection closed by peer");
                return;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("connection broke: {}", e);
                return;
            }
        };

        let num_complete = match task.reader.append(&buf[..n]) {
            Ok(n) => n,
            Err(e) => {
                warn!("closing connection: {}", e);
                return;
            }
        };
        if num_complete == 0 {
            continue;
        }

        // frames that were complete before a corrupt one are still processed
        let (messages, decoded) = task.reader.execute();
        for msg in messages {
            if let Err(e) = process_message(shared, &mut task.stream, task.peer, msg).await {
                warn!("closing connection: {}", e);
                return;
            }
        }
        if let Err(e) = decoded {
            warn!("closing connection: {}", e);
            return;
        }
    }
}

async fn process_message(shared: &Shared, stream: &mut TcpStream, peer: SocketAddr, msg: ChannelMessage) -> Result<(), TransportError> {
    trace!("received message {} from {:?}", msg.unique_id, msg.address);

    match msg.options.ack_mode() {
        AckMode::None => {
            dispatch(shared, msg).await;
        }
        AckMode::BeforeDispatch => {
            write_ack(shared, stream, peer, AckKind::Ack).await?;
            dispatch(shared, msg).await;
        }
        AckMode::AfterDispatch => {
            let success = dispatch(shared, msg).await;
            write_ack(shared, stream, peer, AckKind::from_success(success)).await?;
        }
    }
    Ok(())
}

/// Runs the callback on its own task so a panic is contained. Returns `true` if the message was
///  processed successfully.
async fn dispatch(shared: &Shared, msg: ChannelMessage) -> bool {
    let dispatcher = shared.dispatcher.clone();
    let unique_id = msg.unique_id;
    let handle = tokio::spawn(async move {
        dispatcher.on_message(&msg).await
    });

    match handle.await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("processing message {} failed: {}", unique_id, e);
            false
        }
        Err(e) => {
            error!("processing message {} panicked: {}", unique_id, e);
            false
        }
    }
}

async fn write_ack(shared: &Shared, stream: &mut TcpStream, peer: SocketAddr, ack: AckKind) -> Result<(), TransportError> {
    let timeout = shared.config.timeout;
    match time::timeout(timeout, stream.write_all(ack.bytes())).await {
        Err(_) => Err(TransportError::Timeout { addr: peer, timeout }),
        Ok(Err(source)) => Err(TransportError::Io { addr: peer, source }),
        Ok(Ok(())) => {
            trace!("sent {:?}", ack);
            Ok(())
        }
    }
}
