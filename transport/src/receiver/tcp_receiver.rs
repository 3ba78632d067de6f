use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use socket2::SockRef;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::message_dispatcher::MessageDispatcher;
use crate::receiver::worker_pool::{ReceiveTask, WorkerPool};
use crate::shutdown::{Shutdown, ShutdownListener};
use crate::socket_options::apply_socket_options;

/// The receiving side of the transport: accepts connections from peers and hands each of them
///  to the worker pool.
pub struct TcpReceiver {
    config: Arc<TransportConfig>,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    workers: Arc<WorkerPool>,
    shutdown: Shutdown,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TcpReceiver {
    /// Binds the listening socket and starts the worker pool. Connections are accepted only after
    ///  `start()` was called.
    pub async fn bind(config: Arc<TransportConfig>, dispatcher: Arc<dyn MessageDispatcher>) -> Result<TcpReceiver, TransportError> {
        let listener = bind_listener(&config).await?;
        let local_addr = listener.local_addr()
            .map_err(|source| TransportError::Bind { addr: config.bind_addr, source })?;
        info!("receiver bound to {}", local_addr);

        let workers = Arc::new(WorkerPool::new(config.clone(), dispatcher));

        Ok(TcpReceiver {
            config,
            local_addr,
            listener: Mutex::new(Some(listener)),
            workers,
            shutdown: Shutdown::new(),
            accept_handle: Default::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.workers
    }

    /// Spawns the accept loop. Calling this more than once has no effect.
    pub fn start(&self) {
        let listener = self.listener.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listener) = listener else {
            debug!("receiver on {} was already started", self.local_addr);
            return;
        };

        let handle = tokio::spawn(accept_loop(
            listener,
            self.config.clone(),
            self.workers.clone(),
            self.shutdown.subscribe(),
        ));
        *self.accept_handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stops accepting, closes the listening socket, and terminates all workers - connections that
    ///  are being serviced are closed.
    pub async fn stop(&self) {
        info!("stopping receiver on {}", self.local_addr);
        self.shutdown.trigger();
        self.listener.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handle = self.accept_handle.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("accept loop failed: {}", e);
            }
        }

        self.workers.shutdown().await;
    }
}

/// Binds to the configured address. If the port is in use, the following ports are tried up to
///  `auto_bind_attempts` times.
async fn bind_listener(config: &TransportConfig) -> Result<TcpListener, TransportError> {
    let mut addr = config.bind_addr;
    let mut attempts_left = config.auto_bind_attempts;

    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse
                && attempts_left > 0
                && addr.port() != 0
                && addr.port() < u16::MAX =>
            {
                debug!("{} is in use, trying the next port", addr);
                attempts_left -= 1;
                addr.set_port(addr.port() + 1);
            }
            Err(source) => return Err(TransportError::Bind { addr, source }),
        }
    }
}

async fn accept_loop(listener: TcpListener, config: Arc<TransportConfig>, workers: Arc<WorkerPool>, mut shutdown: ShutdownListener) {
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = shutdown.wait() => break,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("accepted connection from {}", peer);
                if let Err(e) = apply_socket_options(SockRef::from(&stream), &config) {
                    warn!("unable to apply socket options to connection from {}: {}", peer, e);
                }

                if workers.idle_workers() == 0 {
                    warn!("all receive workers are busy - connection from {} is queued until a worker becomes available", peer);
                }
                workers.submit(ReceiveTask::new(stream, peer, &config));
            }
            Err(e) => {
                warn!("error accepting connection: {}", e);
                time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    debug!("accept loop terminated");
}
