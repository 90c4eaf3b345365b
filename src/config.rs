use crate::error::ConfigError;
use crate::pipe::PipeConfig;
use crate::record;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for a `switchboard` engine.
///
/// The defaults are serviceable for small deployments; every limit is
/// unlimited unless set. Limits set to zero are rejected when the engine
/// starts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub(crate) max_connections: Option<usize>,
    pub(crate) max_sessions: Option<usize>,
    pub(crate) max_sessions_per_connection: Option<usize>,
    pub(crate) output_buffer_size: usize,
    pub(crate) params_buffer_size: usize,
    pub(crate) memory_threshold: usize,
    pub(crate) memory_chunk_size: usize,
    pub(crate) file_chunk_size: u64,
    pub(crate) spill_dir: Option<PathBuf>,
    pub(crate) spill_prefix: String,
    pub(crate) spill_suffix: String,
    pub(crate) read_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            max_sessions: None,
            max_sessions_per_connection: None,
            output_buffer_size: 8 * 1024,
            params_buffer_size: 1024,
            memory_threshold: 4 * 1024 * 1024,
            memory_chunk_size: 64 * 1024,
            file_chunk_size: 16 * 1024 * 1024,
            spill_dir: None,
            spill_prefix: "switchboard-".to_string(),
            spill_suffix: ".spill".to_string(),
            read_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps concurrently served connections. Also advertised to the web
    /// server as `FCGI_MAX_CONNS`.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = Some(n);
        self
    }

    /// Caps concurrently served sessions across all connections. Also
    /// advertised as `FCGI_MAX_REQS`.
    pub fn max_sessions(mut self, n: usize) -> Self {
        self.max_sessions = Some(n);
        self
    }

    /// Caps concurrent sessions multiplexed over one connection.
    ///
    /// A cap of 1 declines multiplexing entirely: the engine advertises
    /// `FCGI_MPXS_CONNS` as "0" and refuses overlapping requests with
    /// `CANT_MPX_CONN`.
    pub fn max_sessions_per_connection(mut self, n: usize) -> Self {
        self.max_sessions_per_connection = Some(n);
        self
    }

    /// Sets the default response body buffer size.
    ///
    /// Rounded up to the record writer's alignment. Sessions can override
    /// this individually before their first write.
    pub fn output_buffer_size(mut self, bytes: usize) -> Self {
        self.output_buffer_size = bytes;
        self
    }

    /// Sets the total bytes of pipe buffering held in memory, process-wide,
    /// before new pipe chunks spill to disk.
    pub fn memory_threshold(mut self, bytes: usize) -> Self {
        self.memory_threshold = bytes;
        self
    }

    /// Sets the capacity of one in-memory pipe chunk.
    pub fn memory_chunk_size(mut self, bytes: usize) -> Self {
        self.memory_chunk_size = bytes;
        self
    }

    /// Sets the capacity of one spill file.
    pub fn file_chunk_size(mut self, bytes: u64) -> Self {
        self.file_chunk_size = bytes;
        self
    }

    /// Directory for spill files. Defaults to the system temp directory.
    pub fn spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    /// Applies a read timeout to each connection socket.
    ///
    /// Without one, an idle keep-alive connection pins its worker until the
    /// web server closes it, and [`EngineHandle::stop`](crate::EngineHandle::stop)
    /// waits for that to happen.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub(crate) fn validated(mut self) -> Result<Self, ConfigError> {
        for (limit, name) in [
            (self.max_connections, "max_connections"),
            (self.max_sessions, "max_sessions"),
            (self.max_sessions_per_connection, "max_sessions_per_connection"),
        ] {
            if limit == Some(0) {
                return Err(ConfigError::ZeroLimit(name));
            }
        }

        for (size, name) in [
            (self.output_buffer_size, "output_buffer_size"),
            (self.params_buffer_size, "params_buffer_size"),
            (self.memory_chunk_size, "memory_chunk_size"),
        ] {
            if size == 0 {
                return Err(ConfigError::ZeroSize(name));
            }
        }
        if self.file_chunk_size == 0 {
            return Err(ConfigError::ZeroSize("file_chunk_size"));
        }

        self.output_buffer_size = round_up(self.output_buffer_size, record::ALIGNMENT);
        Ok(self)
    }

    pub(crate) fn pipe_config(&self) -> PipeConfig {
        PipeConfig {
            memory_chunk_size: self.memory_chunk_size,
            file_chunk_size: self.file_chunk_size,
            spill_dir: self.spill_dir.clone(),
            spill_prefix: self.spill_prefix.clone(),
            spill_suffix: self.spill_suffix.clone(),
        }
    }

    /// "1" when this engine accepts interleaved requests on one connection.
    pub(crate) fn advertises_multiplexing(&self) -> bool {
        self.max_sessions_per_connection != Some(1)
    }
}

fn round_up(n: usize, alignment: usize) -> usize {
    n.div_ceil(alignment) * alignment
}
