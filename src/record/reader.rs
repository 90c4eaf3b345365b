use super::pairs;
use super::BeginRequest;
use super::{
    FCGI_ABORT_REQUEST, FCGI_BEGIN_REQUEST, FCGI_DATA, FCGI_END_REQUEST, FCGI_GET_VALUES,
    FCGI_GET_VALUES_RESULT, FCGI_PARAMS, FCGI_STDERR, FCGI_STDIN, FCGI_STDOUT, FCGI_UNKNOWN_TYPE,
};
use crate::error::TransportError;
use std::io::{self, Read};

/// Typed callbacks for the records a web server sends an application.
///
/// Streaming types (`PARAMS`, `STDIN`, `DATA`) deliver their content a
/// record at a time; empty content marks the end of that stream.
pub(crate) trait RecordSink {
    fn begin_request(&mut self, request_id: u16, begin: BeginRequest);
    fn abort_request(&mut self, request_id: u16);
    fn params(&mut self, request_id: u16, content: &[u8]);
    fn stdin(&mut self, request_id: u16, content: &[u8]);
    fn data(&mut self, request_id: u16, content: &[u8]);
    fn get_values(&mut self, request_id: u16, names: Vec<String>);
    /// A record whose type code is not part of the protocol.
    fn unknown_type(&mut self, type_id: u8, request_id: u16);
    /// A recognized record that is structurally broken, or one an
    /// application should never receive.
    fn malformed(&mut self, type_id: u8, request_id: u16, what: &'static str);
}

/// Unframes the inbound byte stream one record at a time.
///
/// The reader holds at most one record's content in its own buffer; the
/// buffer is reused across records. Padding is always drained, whether or
/// not the sink cares about the content.
pub(crate) struct RecordReader<R> {
    input: R,
    content: Vec<u8>,
}

impl<R: Read> RecordReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            content: Vec::new(),
        }
    }

    /// Reads one complete record and dispatches it to `sink`.
    ///
    /// Returns `Ok(false)` on a clean end-of-stream at a record boundary.
    /// End-of-stream anywhere inside a record is a truncation fault.
    pub fn process_record(&mut self, sink: &mut dyn RecordSink) -> Result<bool, TransportError> {
        let mut header = [0u8; 8];

        let first = loop {
            match self.input.read(&mut header) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e)),
            }
        };
        if first == 0 {
            return Ok(false);
        }
        read_fully(&mut self.input, &mut header[first..])?;

        let [version, type_id, id_1, id_0, len_1, len_0, padding, _] = header;

        if version != 1 {
            return Err(TransportError::UnsupportedVersion(version));
        }

        let request_id = u16::from_be_bytes([id_1, id_0]);
        let length = u16::from_be_bytes([len_1, len_0]) as usize;

        self.content.resize(length, 0);
        read_fully(&mut self.input, &mut self.content)?;

        let mut pad = [0u8; 255];
        read_fully(&mut self.input, &mut pad[..padding as usize])?;

        match type_id {
            FCGI_BEGIN_REQUEST => match BeginRequest::from_content(&self.content) {
                Some(begin) => sink.begin_request(request_id, begin),
                None => sink.malformed(type_id, request_id, "BeginRequest"),
            },
            FCGI_ABORT_REQUEST => {
                if self.content.is_empty() {
                    sink.abort_request(request_id);
                } else {
                    sink.malformed(type_id, request_id, "AbortRequest");
                }
            }
            FCGI_PARAMS => sink.params(request_id, &self.content),
            FCGI_STDIN => sink.stdin(request_id, &self.content),
            FCGI_DATA => sink.data(request_id, &self.content),
            FCGI_GET_VALUES => sink.get_values(request_id, pairs::decode_names(&self.content)),
            FCGI_END_REQUEST | FCGI_STDOUT | FCGI_STDERR | FCGI_GET_VALUES_RESULT
            | FCGI_UNKNOWN_TYPE => {
                sink.malformed(type_id, request_id, "record type not valid towards an application");
            }
            _ => sink.unknown_type(type_id, request_id),
        }

        Ok(true)
    }
}

fn read_fully<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<(), TransportError> {
    input.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => TransportError::TruncatedRecord,
        _ => TransportError::Io(e),
    })
}
