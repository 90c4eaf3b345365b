//! Per-request state.
//!
//! A session is born on `BEGIN_REQUEST`, accumulates its parameter stream,
//! runs the application handler on the connection's session executor, and
//! dies after its single `END_REQUEST` leaves the wire. The connection
//! reader feeds it; the handler drains it; the two only meet through the
//! session's pipes and the shared record writer.

use crate::connection::ConnShared;
use crate::context::{AuthorizerContext, Context, Input, Service};
use crate::engine::EngineShared;
use crate::error::{panic_message, AbortReason, HandlerError, OutputError, TransportError};
use crate::pipe::Pipe;
use crate::record::pairs::PairDecoder;
use crate::record::{ProtocolStatus, Role, ALIGNMENT};
use crate::response::{self, FieldMap};
use std::collections::BTreeMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// How the application handler came to an end.
#[derive(Debug)]
pub(crate) enum Outcome {
    Complete,
    Cancelled,
    Overloaded,
    Failed(String),
}

enum ParamsPhase {
    Receiving {
        decoder: PairDecoder,
        map: BTreeMap<String, String>,
    },
    Frozen(Arc<BTreeMap<String, String>>),
}

struct Output {
    // Pending CGI status code; pinned to -1 once the header block is
    // rendered, after which the response surface rejects changes.
    status: i32,
    status_set: bool,
    fields: FieldMap,
    exit_code: i32,
    buffer: Vec<u8>,
    buffer_size: usize,
    body_written: bool,
    closed: bool,
}

impl Output {
    fn header_rendered(&self) -> bool {
        self.status < 0
    }

    fn render_header(&mut self) {
        if !self.header_rendered() {
            let block = response::render_header_block(self.status as u16, &self.fields);
            self.buffer.extend_from_slice(&block);
            self.status = -1;
        }
    }
}

pub(crate) struct Session {
    request_id: u16,
    service: Service,
    conn: Arc<ConnShared>,
    engine: Arc<EngineShared>,
    params: Mutex<ParamsPhase>,
    stdin: Option<Arc<Pipe>>,
    data: Option<Arc<Pipe>>,
    output: Mutex<Output>,
    cancelled: AtomicBool,
    started: AtomicBool,
    terminated: AtomicBool,
}

impl Session {
    pub fn new(
        request_id: u16,
        service: Service,
        conn: Arc<ConnShared>,
        engine: Arc<EngineShared>,
    ) -> Arc<Self> {
        let role = service.role();
        let pipe_config = engine.config.pipe_config();

        let stdin = matches!(role, Role::Responder | Role::Filter)
            .then(|| Pipe::new(pipe_config.clone(), Arc::clone(&engine.budget)));
        let data =
            matches!(role, Role::Filter).then(|| Pipe::new(pipe_config, Arc::clone(&engine.budget)));

        let decoder = PairDecoder::new(engine.param_buffers.acquire());
        let buffer_size = engine.config.output_buffer_size;

        Arc::new(Self {
            request_id,
            service,
            conn,
            engine,
            params: Mutex::new(ParamsPhase::Receiving {
                decoder,
                map: BTreeMap::new(),
            }),
            stdin,
            data,
            output: Mutex::new(Output {
                status: 200,
                status_set: false,
                fields: FieldMap::default(),
                exit_code: 0,
                buffer: Vec::new(),
                buffer_size,
                body_written: false,
                closed: false,
            }),
            cancelled: AtomicBool::new(false),
            started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub fn role(&self) -> Role {
        self.service.role()
    }

    // ---- record input, called on the connection reader thread ----

    pub fn params_bytes(&self, content: &[u8]) {
        let mut phase = self.params.lock().unwrap();
        match &mut *phase {
            ParamsPhase::Receiving { decoder, map } => {
                decoder.push(content, &mut |name, value| {
                    map.insert(name, value);
                });
            }
            ParamsPhase::Frozen(_) => {
                log::warn!(
                    conn = self.conn.id,
                    request = self.request_id;
                    "PARAMS record after the parameter stream already ended"
                );
            }
        }
    }

    /// Freezes the parameter snapshot and schedules the application task.
    pub fn params_end(self: &Arc<Self>) {
        let mut phase = self.params.lock().unwrap();
        match std::mem::replace(&mut *phase, ParamsPhase::Frozen(Arc::new(BTreeMap::new()))) {
            ParamsPhase::Receiving { decoder, map } => {
                let (buffer, residue) = decoder.finish();
                self.engine.param_buffers.release(buffer);
                if residue > 0 {
                    log::warn!(
                        conn = self.conn.id,
                        request = self.request_id,
                        residue = residue;
                        "parameter stream ended inside a name-value pair"
                    );
                }
                *phase = ParamsPhase::Frozen(Arc::new(map));
            }
            ParamsPhase::Frozen(map) => {
                log::warn!(
                    conn = self.conn.id,
                    request = self.request_id;
                    "repeated end of the parameter stream"
                );
                *phase = ParamsPhase::Frozen(map);
                return;
            }
        }
        drop(phase);

        self.started.store(true, Ordering::SeqCst);
        let session = Arc::clone(self);
        self.conn.session_pool.execute(move || session.run());
    }

    pub fn stdin_bytes(&self, content: &[u8]) -> io::Result<()> {
        match &self.stdin {
            Some(pipe) => pipe.write(content),
            None => {
                self.log_unexpected_stream("STDIN");
                Ok(())
            }
        }
    }

    pub fn stdin_end(&self) {
        match &self.stdin {
            Some(pipe) => pipe.close(),
            None => self.log_unexpected_stream("STDIN"),
        }
    }

    pub fn data_bytes(&self, content: &[u8]) -> io::Result<()> {
        match &self.data {
            Some(pipe) => pipe.write(content),
            None => {
                self.log_unexpected_stream("DATA");
                Ok(())
            }
        }
    }

    pub fn data_end(&self) {
        match &self.data {
            Some(pipe) => pipe.close(),
            None => self.log_unexpected_stream("DATA"),
        }
    }

    fn log_unexpected_stream(&self, stream: &str) {
        log::warn!(
            conn = self.conn.id,
            request = self.request_id,
            stream = stream;
            "stream record for a role that has no such stream"
        );
    }

    /// Cancels the session.
    ///
    /// Cancellation is cooperative: the input pipes fail over to the
    /// session-aborted reason so blocked reads wake, and the handler's
    /// eventual return is reported as `(-1, REQUEST_COMPLETE)`. A session
    /// whose task was never scheduled completes right here.
    pub fn abort(self: &Arc<Self>) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.abort_pipes(AbortReason::SessionAborted);

        if !self.started.load(Ordering::SeqCst) {
            self.finish(Outcome::Cancelled);
        }
    }

    /// Marks the session dead because its connection failed.
    ///
    /// No `END_REQUEST` is attempted; there is no wire to say it on. A
    /// session whose task was never scheduled is retired here, so its
    /// admission slot is still returned.
    pub fn transport_failed(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.abort_pipes(AbortReason::TransportFailed);

        if !self.started.load(Ordering::SeqCst) {
            self.finish(Outcome::Cancelled);
        }
    }

    fn abort_pipes(&self, reason: AbortReason) {
        if let Some(pipe) = &self.stdin {
            pipe.abort(reason);
        }
        if let Some(pipe) = &self.data {
            pipe.abort(reason);
        }
    }

    // ---- the application task, run on the session executor ----

    fn run(self: Arc<Self>) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch()));

        let mut outcome = match result {
            Ok(Ok(())) => Outcome::Complete,
            Ok(Err(HandlerError::Overloaded)) => Outcome::Overloaded,
            Ok(Err(error)) => Outcome::Failed(error.to_string()),
            Err(panic) => Outcome::Failed(
                panic_message(panic.as_ref())
                    .unwrap_or_else(|| "the handler panicked".to_string()),
            ),
        };
        if self.cancelled.load(Ordering::SeqCst) {
            outcome = Outcome::Cancelled;
        }

        self.finish(outcome);
    }

    fn dispatch(self: &Arc<Self>) -> Result<(), HandlerError> {
        let params = self.frozen_params();

        match &self.service {
            Service::Responder(handler) => {
                let mut stdin = Input::new(self.stdin.as_ref());
                let mut ctx = Context::new(Arc::clone(self), params);
                handler.respond(&mut ctx, &mut stdin)
            }
            Service::Authorizer(handler) => {
                let mut ctx = AuthorizerContext::new(Context::new(Arc::clone(self), params));
                handler.authorize(&mut ctx)
            }
            Service::Filter(handler) => {
                let mut stdin = Input::new(self.stdin.as_ref());
                let mut data = Input::new(self.data.as_ref());
                let mut ctx = Context::new(Arc::clone(self), params);
                handler.filter(&mut ctx, &mut stdin, &mut data)
            }
        }
    }

    fn frozen_params(&self) -> Arc<BTreeMap<String, String>> {
        match &*self.params.lock().unwrap() {
            ParamsPhase::Frozen(map) => Arc::clone(map),
            ParamsPhase::Receiving { .. } => unreachable!("task scheduled before params froze"),
        }
    }

    // ---- response surface, called from the handler through `Context` ----

    pub(crate) fn write_body(&self, content: &[u8]) -> io::Result<()> {
        let mut out = self.output.lock().unwrap();
        if out.closed {
            return Err(OutputError::Closed.into());
        }

        if !out.body_written {
            out.body_written = true;
            let buffer_size = out.buffer_size;
            out.buffer.reserve(buffer_size);
        }
        out.render_header();
        out.buffer.extend_from_slice(content);

        if out.buffer.len() >= out.buffer_size {
            self.conn.writer.write_stdout(self.request_id, &out.buffer)?;
            out.buffer.clear();
        }
        Ok(())
    }

    pub(crate) fn flush_body(&self) -> io::Result<()> {
        let mut out = self.output.lock().unwrap();
        if out.closed {
            return Err(OutputError::Closed.into());
        }

        out.body_written = true;
        out.render_header();
        if !out.buffer.is_empty() {
            self.conn.writer.write_stdout(self.request_id, &out.buffer)?;
            out.buffer.clear();
        }
        self.conn.writer.flush()
    }

    pub(crate) fn write_err(&self, content: &[u8]) -> io::Result<()> {
        if content.is_empty() {
            return Ok(());
        }
        self.conn.writer.write_stderr(self.request_id, content)
    }

    pub(crate) fn flush_err(&self) -> io::Result<()> {
        self.conn.writer.flush()
    }

    pub(crate) fn set_status(&self, code: u16) -> Result<(), OutputError> {
        let mut out = self.output.lock().unwrap();
        if out.header_rendered() || out.closed {
            return Err(OutputError::HeaderSent);
        }
        if !(100..600).contains(&code) {
            return Err(OutputError::InvalidStatus(code));
        }
        out.status = code as i32;
        out.status_set = true;
        Ok(())
    }

    pub(crate) fn set_field(&self, name: &str, value: &str, append: bool) -> Result<(), OutputError> {
        let mut out = self.output.lock().unwrap();
        if out.header_rendered() || out.closed {
            return Err(OutputError::HeaderSent);
        }

        if append {
            out.fields.add(name, value)?;
        } else {
            out.fields.set(name, value)?;
        }

        // An authorizer that attaches a real response field while the code
        // is still the untouched default is describing a denial.
        if self.role() == Role::Authorizer
            && !response::is_variable(name)
            && !out.status_set
            && out.status == 200
        {
            out.status = 401;
        }
        Ok(())
    }

    pub(crate) fn set_buffer_size(&self, bytes: usize) -> Result<(), OutputError> {
        let mut out = self.output.lock().unwrap();
        if out.body_written {
            return Err(OutputError::BufferPinned);
        }
        out.buffer_size = bytes.div_ceil(ALIGNMENT) * ALIGNMENT;
        Ok(())
    }

    pub(crate) fn exit(&self, code: i32) -> Result<(), OutputError> {
        if code < 0 {
            return Err(OutputError::InvalidExitCode(code));
        }
        self.output.lock().unwrap().exit_code = code;
        Ok(())
    }

    // ---- teardown ----

    /// Closes the session out: response header if still pending, stream end
    /// records, the one `END_REQUEST`, removal from the connection index.
    ///
    /// Exactly one caller wins; later calls are no-ops.
    pub(crate) fn finish(&self, outcome: Outcome) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        // A leaked `Input` must not block forever once the session is gone.
        self.abort_pipes(AbortReason::SessionAborted);

        if !self.conn.failed() {
            if let Err(error) = self.write_epilogue(&outcome) {
                self.conn.fail(&TransportError::Io(error));
            }
        }

        self.conn.remove_session(self.request_id);
        self.engine.session_done();
    }

    fn write_epilogue(&self, outcome: &Outcome) -> io::Result<()> {
        let mut out = self.output.lock().unwrap();
        out.closed = true;

        if let Outcome::Failed(message) = outcome {
            if !out.header_rendered() {
                out.status = 501;
                out.status_set = true;
                out.fields.clear();
                let _ = out.fields.set("Content-Type", "text/plain; charset=utf-8");
                out.buffer.clear();
                out.render_header();
                out.buffer.extend_from_slice(b"Internal Server Error");
            }
            let mut report = message.clone();
            report.push('\n');
            self.conn.writer.write_stderr(self.request_id, report.as_bytes())?;
        }

        out.render_header();
        if !out.buffer.is_empty() {
            self.conn.writer.write_stdout(self.request_id, &out.buffer)?;
            out.buffer.clear();
        }
        self.conn.writer.end_stdout(self.request_id)?;
        self.conn.writer.end_stderr(self.request_id)?;

        let (app_status, protocol_status) = match outcome {
            Outcome::Complete => (out.exit_code, ProtocolStatus::RequestComplete),
            Outcome::Cancelled => (-1, ProtocolStatus::RequestComplete),
            Outcome::Overloaded => (-2, ProtocolStatus::Overloaded),
            Outcome::Failed(_) => (-2, ProtocolStatus::RequestComplete),
        };
        self.conn
            .writer
            .write_end_request(self.request_id, app_status, protocol_status)
    }
}
