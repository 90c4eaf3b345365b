//! One web server connection: the inbound reader loop and the state shared
//! with every session multiplexed over it.
//!
//! The reader loop owns the read half exclusively and dispatches records by
//! request id. Sessions never see the connection itself; they hold
//! [`ConnShared`], which carries the record writer, the session index, and
//! the lifecycle flags. That one-way reference is what lets a session
//! outlive a record without the connection and session owning each other.

use crate::engine::EngineShared;
use crate::error::TransportError;
use crate::record::{BeginRequest, ProtocolStatus, RecordReader, RecordSink, RecordWriter};
use crate::session::Session;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use threadpool::ThreadPool;

type Closer = Box<dyn FnOnce() + Send>;

/// The connection state sessions hold on to.
pub(crate) struct ConnShared {
    pub(crate) id: u64,
    pub(crate) writer: RecordWriter<Box<dyn Write + Send>>,
    pub(crate) session_pool: ThreadPool,
    sessions: Mutex<HashMap<u16, Arc<Session>>>,
    keep_going: AtomicBool,
    failed: AtomicBool,
    closed: AtomicBool,
    closer: Mutex<Option<Closer>>,
}

impl ConnShared {
    pub fn new(
        id: u64,
        writer: RecordWriter<Box<dyn Write + Send>>,
        session_pool: ThreadPool,
        closer: Closer,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            writer,
            session_pool,
            sessions: Mutex::new(HashMap::new()),
            keep_going: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closer: Mutex::new(Some(closer)),
        })
    }

    pub fn keep_going(&self) -> bool {
        self.keep_going.load(Ordering::SeqCst)
    }

    /// Records that no further requests will be accepted on this
    /// connection, either because the web server said so or because we are
    /// declining them.
    pub fn decline_further_requests(&self) {
        self.keep_going.store(false, Ordering::SeqCst);
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn get_session(&self, request_id: u16) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(&request_id).cloned()
    }

    /// Returns false when the id is already live; the caller decides what
    /// that means for the connection.
    pub fn insert_session(&self, request_id: u16, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&request_id) {
            return false;
        }
        sessions.insert(request_id, session);
        true
    }

    /// Drops a completed session from the index; the last removal on a
    /// connection that will see no more requests also closes the transport.
    pub fn remove_session(&self, request_id: u16) {
        let empty = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.remove(&request_id);
            sessions.is_empty()
        };

        if empty && !self.keep_going() {
            let _ = self.writer.flush();
            self.close_transport();
        }
    }

    /// The transport-fault funnel: marks the connection dead, stops
    /// admission, signals every live session, and closes the socket.
    pub fn fail(&self, error: &TransportError) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.decline_further_requests();

        log::error!(
            conn = self.id,
            error:err = *error;
            "connection failed, aborting its live sessions"
        );

        let sessions: Vec<_> = self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            session.transport_failed();
        }

        self.close_transport();
    }

    /// Shuts the underlying socket down. Idempotent.
    pub fn close_transport(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(close) = self.closer.lock().unwrap().take() {
            close();
        }
    }

    fn clear_sessions(&self) {
        self.sessions.lock().unwrap().clear();
    }
}

/// The inbound half of a connection: reads records, dispatches them.
pub(crate) struct Connection<R> {
    reader: RecordReader<R>,
    dispatcher: Dispatcher,
}

impl<R: Read> Connection<R> {
    pub fn new(input: R, shared: Arc<ConnShared>, engine: Arc<EngineShared>) -> Self {
        Self {
            reader: RecordReader::new(input),
            dispatcher: Dispatcher { shared, engine },
        }
    }

    /// Runs the reader loop to completion and tears the connection down.
    pub fn run(mut self) {
        let shared = Arc::clone(&self.dispatcher.shared);
        let engine = Arc::clone(&self.dispatcher.engine);

        loop {
            if shared.failed() || (!shared.keep_going() && shared.live_sessions() == 0) {
                break;
            }

            match self.reader.process_record(&mut self.dispatcher) {
                Ok(true) => {}
                Ok(false) => {
                    // End-of-stream between records: clean only if nothing
                    // is outstanding.
                    if shared.live_sessions() > 0 {
                        shared.fail(&TransportError::Io(io::ErrorKind::UnexpectedEof.into()));
                    }
                    break;
                }
                Err(error) => {
                    if shared.closed() {
                        // We shut the socket down ourselves; the read error
                        // is just the echo of that.
                    } else if is_idle_timeout(&error) && shared.live_sessions() == 0 {
                        log::debug!(conn = shared.id; "closing idle connection after read timeout");
                    } else {
                        shared.fail(&error);
                    }
                    break;
                }
            }
        }

        // Let in-flight handlers drain before the connection goes away.
        shared.session_pool.join();
        shared.clear_sessions();
        shared.close_transport();
        engine.connection_done();
        log::debug!(conn = shared.id; "connection closed");
    }
}

fn is_idle_timeout(error: &TransportError) -> bool {
    match error {
        TransportError::Io(e) => {
            matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        }
        _ => false,
    }
}

struct Dispatcher {
    shared: Arc<ConnShared>,
    engine: Arc<EngineShared>,
}

impl Dispatcher {
    fn refuse(&self, request_id: u16, status: ProtocolStatus) {
        if let Err(error) = self.shared.writer.write_end_request(request_id, -3, status) {
            self.shared.fail(&TransportError::Io(error));
        }
    }
}

impl RecordSink for Dispatcher {
    fn begin_request(&mut self, request_id: u16, begin: BeginRequest) {
        let shared = &self.shared;

        if shared.failed() || !shared.keep_going() {
            self.refuse(request_id, ProtocolStatus::Overloaded);
            return;
        }

        if !begin.keep_conn() {
            shared.decline_further_requests();
        }

        if let Some(cap) = self.engine.config.max_sessions_per_connection {
            if shared.live_sessions() >= cap {
                let status = if cap == 1 {
                    ProtocolStatus::CantMultiplex
                } else {
                    ProtocolStatus::Overloaded
                };
                self.refuse(request_id, status);
                return;
            }
        }

        if !self.engine.try_admit_session() {
            self.refuse(request_id, ProtocolStatus::Overloaded);
            return;
        }

        let Some(service) = self.engine.services.resolve(begin.role) else {
            self.engine.session_done();
            self.refuse(request_id, ProtocolStatus::UnknownRole);
            return;
        };

        let session = Session::new(
            request_id,
            service,
            Arc::clone(shared),
            Arc::clone(&self.engine),
        );
        if !shared.insert_session(request_id, session) {
            self.engine.session_done();
            shared.decline_further_requests();
            log::error!(
                conn = shared.id,
                request = request_id;
                "web server reused a live request id"
            );
        }
    }

    fn abort_request(&mut self, request_id: u16) {
        // Aborts for ids we no longer (or never did) track are ignored.
        if let Some(session) = self.shared.get_session(request_id) {
            session.abort();
        }
    }

    fn params(&mut self, request_id: u16, content: &[u8]) {
        match self.shared.get_session(request_id) {
            Some(session) => {
                if content.is_empty() {
                    session.params_end();
                } else {
                    session.params_bytes(content);
                }
            }
            None => self.drop_record("PARAMS", request_id),
        }
    }

    fn stdin(&mut self, request_id: u16, content: &[u8]) {
        match self.shared.get_session(request_id) {
            Some(session) => {
                if content.is_empty() {
                    session.stdin_end();
                } else if let Err(error) = session.stdin_bytes(content) {
                    self.fail_session_input(&session, error);
                }
            }
            None => self.drop_record("STDIN", request_id),
        }
    }

    fn data(&mut self, request_id: u16, content: &[u8]) {
        match self.shared.get_session(request_id) {
            Some(session) => {
                if content.is_empty() {
                    session.data_end();
                } else if let Err(error) = session.data_bytes(content) {
                    self.fail_session_input(&session, error);
                }
            }
            None => self.drop_record("DATA", request_id),
        }
    }

    fn get_values(&mut self, request_id: u16, names: Vec<String>) {
        if request_id != 0 {
            log::warn!(
                conn = self.shared.id,
                request = request_id;
                "GET_VALUES with a non-management request id"
            );
            return;
        }

        let config = &self.engine.config;
        let mut values = BTreeMap::new();
        for name in names {
            let value = match name.as_str() {
                "FCGI_MAX_CONNS" => config.max_connections.map(|n| n.to_string()),
                "FCGI_MAX_REQS" => config.max_sessions.map(|n| n.to_string()),
                "FCGI_MPXS_CONNS" => {
                    let mpxs = if config.advertises_multiplexing() { "1" } else { "0" };
                    Some(mpxs.to_string())
                }
                _ => None,
            };
            if let Some(value) = value {
                values.insert(name, value);
            }
        }

        if let Err(error) = self.shared.writer.write_values(&values) {
            self.shared.fail(&TransportError::Io(error));
        }
    }

    fn unknown_type(&mut self, type_id: u8, request_id: u16) {
        log::warn!(
            conn = self.shared.id,
            record_type = type_id,
            request = request_id;
            "record of an unknown type"
        );
        if let Err(error) = self.shared.writer.write_unknown_type(type_id) {
            self.shared.fail(&TransportError::Io(error));
        }
    }

    fn malformed(&mut self, type_id: u8, request_id: u16, what: &'static str) {
        log::warn!(
            conn = self.shared.id,
            record_type = type_id,
            request = request_id,
            problem = what;
            "malformed record"
        );
        if request_id != 0 {
            if let Some(session) = self.shared.get_session(request_id) {
                session.abort();
            }
        }
    }
}

impl Dispatcher {
    fn drop_record(&self, stream: &str, request_id: u16) {
        log::debug!(
            conn = self.shared.id,
            stream = stream,
            request = request_id;
            "dropping stream record for a request id with no live session"
        );
    }

    fn fail_session_input(&self, session: &Arc<Session>, error: io::Error) {
        log::error!(
            conn = self.shared.id,
            request = session.request_id(),
            error:err = error;
            "failed to buffer stream input, aborting the session"
        );
        session.abort();
    }
}
