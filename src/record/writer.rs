use super::end_request;
use super::ProtocolStatus;
use super::{pairs, ALIGNMENT, MAX_CONTENT, OPTIMUM_CONTENT};
use super::{
    FCGI_END_REQUEST, FCGI_GET_VALUES_RESULT, FCGI_NULL_REQUEST_ID, FCGI_STDERR, FCGI_STDOUT,
    FCGI_UNKNOWN_TYPE,
};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Mutex;

const ZEROES: [u8; ALIGNMENT] = [0; ALIGNMENT];

/// Frames outbound records on a connection.
///
/// One writer is shared by every session on the connection plus the reader
/// loop; the mutex guarantees a record's header, content, and padding reach
/// the wire as one unit. Payloads larger than a record's 16-bit content
/// limit are split across records of [`OPTIMUM_CONTENT`] bytes.
pub(crate) struct RecordWriter<W> {
    inner: Mutex<W>,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            inner: Mutex::new(out),
        }
    }

    pub fn write_stdout(&self, request_id: u16, data: &[u8]) -> io::Result<()> {
        self.write_stream(FCGI_STDOUT, request_id, data)
    }

    pub fn write_stderr(&self, request_id: u16, data: &[u8]) -> io::Result<()> {
        self.write_stream(FCGI_STDERR, request_id, data)
    }

    pub fn end_stdout(&self, request_id: u16) -> io::Result<()> {
        self.end_stream(FCGI_STDOUT, request_id)
    }

    pub fn end_stderr(&self, request_id: u16) -> io::Result<()> {
        self.end_stream(FCGI_STDERR, request_id)
    }

    // Empty data writes nothing: an empty stream record means end-of-stream
    // and only `end_stream` is allowed to say that.
    fn write_stream(&self, type_id: u8, request_id: u16, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut out = self.inner.lock().unwrap();
        for chunk in data.chunks(OPTIMUM_CONTENT) {
            write_record(&mut *out, type_id, request_id, chunk)?;
        }
        Ok(())
    }

    fn end_stream(&self, type_id: u8, request_id: u16) -> io::Result<()> {
        let mut out = self.inner.lock().unwrap();
        write_record(&mut *out, type_id, request_id, &[])
    }

    /// Writes the final record of a session and flushes, so refusals and
    /// completions reach the web server promptly.
    pub fn write_end_request(
        &self,
        request_id: u16,
        app_status: i32,
        protocol_status: ProtocolStatus,
    ) -> io::Result<()> {
        let content = end_request::to_content(app_status, protocol_status);
        let mut out = self.inner.lock().unwrap();
        write_record(&mut *out, FCGI_END_REQUEST, request_id, &content)?;
        out.flush()
    }

    pub fn write_values(&self, values: &BTreeMap<String, String>) -> io::Result<()> {
        let mut content = vec![];
        pairs::encode(values, &mut content);

        let mut out = self.inner.lock().unwrap();
        write_record(
            &mut *out,
            FCGI_GET_VALUES_RESULT,
            FCGI_NULL_REQUEST_ID,
            &content,
        )?;
        out.flush()
    }

    pub fn write_unknown_type(&self, type_id: u8) -> io::Result<()> {
        let content = [type_id, 0, 0, 0, 0, 0, 0, 0];
        let mut out = self.inner.lock().unwrap();
        write_record(&mut *out, FCGI_UNKNOWN_TYPE, FCGI_NULL_REQUEST_ID, &content)?;
        out.flush()
    }

    pub fn flush(&self) -> io::Result<()> {
        self.inner.lock().unwrap().flush()
    }
}

fn write_record<W: Write>(
    out: &mut W,
    type_id: u8,
    request_id: u16,
    content: &[u8],
) -> io::Result<()> {
    debug_assert!(content.len() <= MAX_CONTENT);

    // Pad the content up to the next multiple of 8.
    let padding = content.len().div_ceil(ALIGNMENT) * ALIGNMENT - content.len();

    let id = request_id.to_be_bytes();
    let length = (content.len() as u16).to_be_bytes();
    out.write_all(&[1, type_id, id[0], id[1], length[0], length[1], padding as u8, 0])?;
    out.write_all(content)?;
    out.write_all(&ZEROES[..padding])
}
