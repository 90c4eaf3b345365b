//! `switchboard` is a multiplexing FastCGI application engine.
//!
//! It speaks the application side of the FastCGI protocol to a web server:
//! it demultiplexes the record stream on each connection into concurrent
//! request sessions, drives the application's [`Responder`], [`Authorizer`],
//! and [`Filter`] handlers, and multiplexes their output and error streams
//! back onto the wire. Request input is decoupled from application
//! consumption by elastic buffering that spills to disk once a process-wide
//! memory budget is spent.
//!
//! ```no_run
//! use switchboard::{Context, EngineConfig, HandlerError, Input, Services};
//! use std::io::Write;
//!
//! let services = Services::new().responder(
//!     |ctx: &mut Context, _stdin: &mut Input| -> Result<(), HandlerError> {
//!         ctx.set_field("Content-Type", "text/plain")?;
//!         ctx.out().write_all(b"hello")?;
//!         Ok(())
//!     },
//! );
//!
//! let handle = switchboard::start(EngineConfig::new(), services, "localhost:9000").unwrap();
//! handle.join();
//! ```

mod config;
mod connection;
mod context;
mod engine;
mod error;
mod pipe;
mod pool;
mod record;
mod response;
mod session;
pub mod status;
#[cfg(test)]
mod testkit;

pub use config::EngineConfig;
pub use context::{
    Authorizer, AuthorizerContext, Body, Context, ErrorStream, Filter, Input, Responder, Services,
};
pub use engine::{start, EngineExitReason, EngineHandle};
pub use error::{
    AbortReason, ConfigError, HandlerError, OutputError, StartError, TransportError,
};
pub use record::Role;
