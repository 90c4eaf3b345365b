//! The engine orchestrator: owns the transport supply, spawns a worker per
//! connection, and carries the process-wide pools every pipe and session
//! draws from.

use crate::config::EngineConfig;
use crate::connection::{ConnShared, Connection};
use crate::context::Services;
use crate::error::{panic_message, StartError};
use crate::pipe::MemoryBudget;
use crate::pool::BufferPool;
use crate::record::RecordWriter;
use mio::event::Events;
use mio::net::TcpListener;
use mio::{Interest, Poll, Token, Waker};
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;
use threadpool::ThreadPool;

// Tokens used for the MIO event loop
const SERVER: Token = Token(0);
const SHUTDOWN: Token = Token(1);

/// State shared by every connection the engine serves.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) services: Services,
    pub(crate) budget: Arc<MemoryBudget>,
    pub(crate) param_buffers: BufferPool,
    live_sessions: AtomicUsize,
    live_connections: AtomicUsize,
    next_connection_id: AtomicU64,
}

impl EngineShared {
    pub fn new(config: EngineConfig, services: Services) -> Arc<Self> {
        let budget = Arc::new(MemoryBudget::new(config.memory_threshold));
        let param_buffers = BufferPool::new(config.params_buffer_size);
        Arc::new(Self {
            config,
            services,
            budget,
            param_buffers,
            live_sessions: AtomicUsize::new(0),
            live_connections: AtomicUsize::new(0),
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Claims a slot under the process-wide session cap.
    pub fn try_admit_session(&self) -> bool {
        match self.config.max_sessions {
            None => {
                self.live_sessions.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(cap) => self
                .live_sessions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < cap).then_some(n + 1)
                })
                .is_ok(),
        }
    }

    pub fn session_done(&self) {
        self.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    fn try_admit_connection(&self) -> Option<u64> {
        let admitted = match self.config.max_connections {
            None => {
                self.live_connections.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(cap) => self
                .live_connections
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < cap).then_some(n + 1)
                })
                .is_ok(),
        };

        admitted.then(|| self.next_connection_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn connection_done(&self) {
        self.live_connections.fetch_sub(1, Ordering::SeqCst);
    }

    fn serve(self: &Arc<Self>, stream: mio::net::TcpStream, workers: &ThreadPool) {
        let Some(conn_id) = self.try_admit_connection() else {
            log::warn!("connection limit reached, refusing a new connection");
            return;
        };

        match self.prepare(stream, conn_id) {
            Ok(connection) => workers.execute(move || connection.run()),
            Err(error) => {
                self.connection_done();
                log::warn!(error:err = error; "failed to set up an accepted connection");
            }
        }
    }

    fn prepare(
        self: &Arc<Self>,
        stream: mio::net::TcpStream,
        conn_id: u64,
    ) -> io::Result<Connection<BufReader<TcpStream>>> {
        // The accept loop needed a non-blocking socket; the per-connection
        // reader and writer threads want a blocking one.
        let stream = TcpStream::from(stream);
        stream.set_nonblocking(false)?;
        if let Some(timeout) = self.config.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }

        let write_half = stream.try_clone()?;
        let close_half = stream.try_clone()?;
        let writer: Box<dyn Write + Send> = Box::new(BufWriter::new(write_half));
        let closer = Box::new(move || {
            let _ = close_half.shutdown(Shutdown::Both);
        });

        let session_pool = match self.config.max_sessions_per_connection {
            Some(cap) => threadpool::Builder::new().num_threads(cap).build(),
            None => threadpool::Builder::new().build(),
        };

        let shared = ConnShared::new(conn_id, RecordWriter::new(writer), session_pool, closer);
        Ok(Connection::new(
            BufReader::new(stream),
            shared,
            Arc::clone(self),
        ))
    }
}

/// The reason the engine exited
#[derive(Debug, Default)]
pub enum EngineExitReason {
    /// It was gracefully shutdown
    #[default]
    Normal,
    /// Polling the listening socket for new connections failed somehow.
    Err(io::Error),
    /// The engine panicked. The payload will contain the panic message.
    Panic(String),
}

/// Handle to a running FastCGI engine
pub struct EngineHandle {
    address: SocketAddr,
    engine_loop: thread::JoinHandle<EngineExitReason>,
    engine_waker: Waker,
    observe_shutdown: Receiver<()>,
}

impl EngineHandle {
    /// Blocks until the engine terminates and returns the reason.
    ///
    /// This function does not attempt to stop the engine.
    /// It waits (potentially indefinitely) until the engine exits.
    /// If you want to stop the engine, use [`stop()`](EngineHandle::stop).
    pub fn join(self) -> EngineExitReason {
        match self.engine_loop.join() {
            Ok(reason) => reason,
            Err(payload) => {
                EngineExitReason::Panic(panic_message(payload.as_ref()).unwrap_or_default())
            }
        }
    }

    /// Stops the engine.
    ///
    /// New connections stop being accepted; connections already being
    /// served drain to completion first.
    pub fn stop(self) {
        // Waking the accept loop is best effort. If the wake itself fails,
        // don't block on a rendezvous that may never happen; and if the
        // recv fails, the loop already exited on its own, which is just as
        // stopped.
        if self.engine_waker.wake().is_ok() {
            let _ = self.observe_shutdown.recv();
        }
    }

    /// Returns the address at which the engine is listening
    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

/// Starts the engine at `address` and returns a handle to it.
///
/// Binding to port `0` will request that the OS assign an available port.
/// If `address` yields multiple addresses, only the first one is considered.
///
/// This function does not block; the accept loop runs on its own thread and
/// every connection is served from a worker pool.
pub fn start(
    config: EngineConfig,
    services: Services,
    address: impl ToSocketAddrs,
) -> Result<EngineHandle, StartError> {
    let config = config.validated()?;

    let mut iter = address.to_socket_addrs().map_err(StartError::Io)?;
    let first_address = iter
        .next()
        .ok_or_else(|| StartError::Io(io::Error::from(io::ErrorKind::InvalidInput)))?;

    let mut socket = TcpListener::bind(first_address).map_err(StartError::Io)?;
    let address = socket.local_addr().map_err(StartError::Io)?;

    log::info!("FastCGI engine listening on {address}");

    let poll = Poll::new().map_err(StartError::Io)?;
    let events = Events::with_capacity(128);
    let engine_waker = Waker::new(poll.registry(), SHUTDOWN).map_err(StartError::Io)?;
    poll.registry()
        .register(&mut socket, SERVER, Interest::READABLE)
        .map_err(StartError::Io)?;

    let (signal_shutdown, observe_shutdown) = sync_channel(0);

    let accept_loop = AcceptLoop {
        socket,
        engine: EngineShared::new(config, services),
        poll,
        events,
        signal_shutdown,
    };

    let engine_loop = thread::spawn(move || run(accept_loop));

    Ok(EngineHandle {
        address,
        engine_loop,
        engine_waker,
        observe_shutdown,
    })
}

struct AcceptLoop {
    socket: TcpListener,
    engine: Arc<EngineShared>,
    poll: Poll,
    events: Events,
    signal_shutdown: SyncSender<()>,
}

fn run(mut accept_loop: AcceptLoop) -> EngineExitReason {
    // `drain_workers` should always be called before exiting this function,
    // regardless of cause, so in-flight connections finish their work.
    let workers = threadpool::Builder::new().build();

    loop {
        match accept_loop.poll.poll(&mut accept_loop.events, None) {
            Ok(_) => {}
            Err(err) => {
                log::warn!(error:err = err; "Poll call failed. Accept loop will exit");
                drain_workers(workers);
                return EngineExitReason::Err(err);
            }
        };

        for event in accept_loop.events.iter() {
            match event.token() {
                SERVER => loop {
                    match accept_loop.socket.accept() {
                        Ok((stream, _)) => accept_loop.engine.serve(stream, &workers),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            log::warn!(error:err = err; "Socket accept call failed. Accept loop will exit");
                            drain_workers(workers);
                            return EngineExitReason::Err(err);
                        }
                    }
                },
                SHUTDOWN => {
                    drain_workers(workers);
                    if accept_loop.signal_shutdown.send(()).is_err() {
                        // Only possible if the handle woke us and then
                        // dropped its receiver before this send, which
                        // `EngineHandle::stop` never does. If it somehow
                        // happens anyway, it should be loud.
                        log::error!(
                            "unreachable code reached! failed to notify engine handle of shutdown."
                        );
                        unreachable!("failed to notify engine handle of shutdown");
                    }
                    return EngineExitReason::Normal;
                }
                _ => unreachable!(),
            }
        }
    }
}

fn drain_workers(workers: ThreadPool) {
    workers.join();
    drop(workers);
}
