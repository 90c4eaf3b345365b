//! What an application handler sees: the role contracts and the per-request
//! context they are handed.

use crate::error::{HandlerError, OutputError};
use crate::pipe::{Pipe, PipeReader};
use crate::record::Role;
use crate::response::VARIABLE_PREFIX;
use crate::session::Session;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Handles requests for the FastCGI `Responder` role.
///
/// Implemented for plain closures of the matching shape, so a full handler
/// type is only needed when it carries state.
pub trait Responder: Send + Sync {
    fn respond(&self, ctx: &mut Context, stdin: &mut Input) -> Result<(), HandlerError>;
}

impl<F> Responder for F
where
    F: Fn(&mut Context, &mut Input) -> Result<(), HandlerError> + Send + Sync,
{
    fn respond(&self, ctx: &mut Context, stdin: &mut Input) -> Result<(), HandlerError> {
        self(ctx, stdin)
    }
}

/// Handles requests for the FastCGI `Authorizer` role.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, ctx: &mut AuthorizerContext) -> Result<(), HandlerError>;
}

impl<F> Authorizer for F
where
    F: Fn(&mut AuthorizerContext) -> Result<(), HandlerError> + Send + Sync,
{
    fn authorize(&self, ctx: &mut AuthorizerContext) -> Result<(), HandlerError> {
        self(ctx)
    }
}

/// Handles requests for the FastCGI `Filter` role.
pub trait Filter: Send + Sync {
    fn filter(
        &self,
        ctx: &mut Context,
        stdin: &mut Input,
        data: &mut Input,
    ) -> Result<(), HandlerError>;
}

impl<F> Filter for F
where
    F: Fn(&mut Context, &mut Input, &mut Input) -> Result<(), HandlerError> + Send + Sync,
{
    fn filter(
        &self,
        ctx: &mut Context,
        stdin: &mut Input,
        data: &mut Input,
    ) -> Result<(), HandlerError> {
        self(ctx, stdin, data)
    }
}

/// The handlers an engine serves, at most one per role.
///
/// Roles with no handler are refused with `UNKNOWN_ROLE`.
#[derive(Clone, Default)]
pub struct Services {
    responder: Option<Arc<dyn Responder>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    filter: Option<Arc<dyn Filter>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn responder(mut self, handler: impl Responder + 'static) -> Self {
        self.responder = Some(Arc::new(handler));
        self
    }

    pub fn authorizer(mut self, handler: impl Authorizer + 'static) -> Self {
        self.authorizer = Some(Arc::new(handler));
        self
    }

    pub fn filter(mut self, handler: impl Filter + 'static) -> Self {
        self.filter = Some(Arc::new(handler));
        self
    }

    /// Looks up the handler for the wire role id, if one is configured.
    pub(crate) fn resolve(&self, role_id: u16) -> Option<Service> {
        match Role::from_id(role_id)? {
            Role::Responder => self.responder.clone().map(Service::Responder),
            Role::Authorizer => self.authorizer.clone().map(Service::Authorizer),
            Role::Filter => self.filter.clone().map(Service::Filter),
        }
    }
}

/// A session's resolved handler.
pub(crate) enum Service {
    Responder(Arc<dyn Responder>),
    Authorizer(Arc<dyn Authorizer>),
    Filter(Arc<dyn Filter>),
}

impl Service {
    pub fn role(&self) -> Role {
        match self {
            Self::Responder(_) => Role::Responder,
            Self::Authorizer(_) => Role::Authorizer,
            Self::Filter(_) => Role::Filter,
        }
    }
}

/// The per-request surface shared by every role.
///
/// Body bytes written through [`out()`](Context::out) are buffered; the CGI
/// response header is emitted exactly once, just before the first body byte
/// reaches the wire (or when the request closes, if the body stays empty).
/// After that, [`set_status`](Context::set_status) and the field setters
/// fail with [`OutputError::HeaderSent`].
pub struct Context {
    session: Arc<Session>,
    params: Arc<BTreeMap<String, String>>,
}

impl Context {
    pub(crate) fn new(session: Arc<Session>, params: Arc<BTreeMap<String, String>>) -> Self {
        Self { session, params }
    }

    /// The immutable parameter snapshot the web server sent.
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Convenience lookup into [`params()`](Context::params).
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn role(&self) -> Role {
        self.session.role()
    }

    /// The response body stream.
    pub fn out(&mut self) -> Body<'_> {
        Body {
            session: self.session.as_ref(),
        }
    }

    /// The error stream, relayed to the web server's log.
    pub fn err(&mut self) -> ErrorStream<'_> {
        ErrorStream {
            session: self.session.as_ref(),
        }
    }

    /// Sets the response status code. `100 <= code < 600`.
    pub fn set_status(&mut self, code: u16) -> Result<(), OutputError> {
        self.session.set_status(code)
    }

    /// Sets a response field, replacing previous fields of the same name.
    ///
    /// Names are case-insensitive and trimmed; `Status` is reserved.
    pub fn set_field(&mut self, name: &str, value: &str) -> Result<(), OutputError> {
        self.session.set_field(name, value, false)
    }

    /// Adds a response field, keeping previous fields of the same name.
    pub fn add_field(&mut self, name: &str, value: &str) -> Result<(), OutputError> {
        self.session.set_field(name, value, true)
    }

    /// Resizes the body buffer. Only honored before the first body write.
    pub fn set_buffer_size(&mut self, bytes: usize) -> Result<(), OutputError> {
        self.session.set_buffer_size(bytes)
    }

    /// Sets the application exit code reported in `END_REQUEST`.
    /// `code` must be non-negative.
    pub fn exit(&mut self, code: i32) -> Result<(), OutputError> {
        self.session.exit(code)
    }
}

/// The context handed to [`Authorizer`] handlers.
///
/// Adds the variable setters; everything else comes from [`Context`].
/// Setting an ordinary response field while the status code is still the
/// untouched default promotes the response to `401 Unauthorized`; variables
/// never do.
pub struct AuthorizerContext {
    inner: Context,
}

impl AuthorizerContext {
    pub(crate) fn new(inner: Context) -> Self {
        Self { inner }
    }

    /// Passes `name` back to the web server as a CGI variable for the
    /// request the authorization decision applies to.
    pub fn set_variable(&mut self, name: &str, value: &str) -> Result<(), OutputError> {
        self.inner
            .session
            .set_field(&format!("{VARIABLE_PREFIX}{name}"), value, false)
    }

    /// Like [`set_variable`](AuthorizerContext::set_variable), but keeps
    /// previous values of the variable.
    pub fn add_variable(&mut self, name: &str, value: &str) -> Result<(), OutputError> {
        self.inner
            .session
            .set_field(&format!("{VARIABLE_PREFIX}{name}"), value, true)
    }
}

impl Deref for AuthorizerContext {
    type Target = Context;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for AuthorizerContext {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// A session input stream (`STDIN`, or `DATA` for filters).
///
/// Reads block until the web server delivers more bytes, return `Ok(0)` at
/// end-of-stream, and fail with `io::ErrorKind::ConnectionAborted` once the
/// request is aborted. A read never returns partial bytes because of
/// cancellation.
pub struct Input {
    reader: Option<PipeReader>,
}

impl Input {
    pub(crate) fn new(pipe: Option<&Arc<Pipe>>) -> Self {
        Self {
            reader: pipe.map(Pipe::reader),
        }
    }
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.reader {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        }
    }
}

/// Writer over the response body. See [`Context::out`].
pub struct Body<'s> {
    session: &'s Session,
}

impl Write for Body<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.session.write_body(buf)?;
        Ok(buf.len())
    }

    /// Forces out the buffered body and, if not yet sent, the header.
    fn flush(&mut self) -> io::Result<()> {
        self.session.flush_body()
    }
}

/// Writer over the error stream. See [`Context::err`].
pub struct ErrorStream<'s> {
    session: &'s Session,
}

impl Write for ErrorStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.session.write_err(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.session.flush_err()
    }
}
