//! A minimal FastCGI web-server side for exercising the engine over TCP.
//!
//! Frames are written and parsed by hand so tests assert exactly what is on
//! the wire: record sizes, padding, alignment, and per-id ordering.

use crate::record::pairs::PairDecoder;
use crate::record::{
    EndRequest, FCGI_ABORT_REQUEST, FCGI_BEGIN_REQUEST, FCGI_DATA, FCGI_END_REQUEST,
    FCGI_GET_VALUES, FCGI_GET_VALUES_RESULT, FCGI_PARAMS, FCGI_STDERR, FCGI_STDIN, FCGI_STDOUT,
};
use bufstream::BufStream;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};

pub(crate) struct Frame {
    pub type_id: u8,
    pub request_id: u16,
    pub content: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct SessionOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_ended: bool,
    pub stderr_ended: bool,
    pub end: Option<EndRequest>,
}

impl SessionOutput {
    pub fn end(&self) -> EndRequest {
        self.end.expect("session not ended")
    }
}

pub(crate) struct WireClient {
    stream: BufStream<TcpStream>,
}

impl WireClient {
    pub fn connect(address: SocketAddr) -> Self {
        let stream = TcpStream::connect(address).unwrap();
        Self {
            stream: BufStream::new(stream),
        }
    }

    pub fn send(&mut self, type_id: u8, request_id: u16, content: &[u8]) {
        assert!(content.len() <= u16::MAX as usize);
        let padding = content.len().div_ceil(8) * 8 - content.len();

        let id = request_id.to_be_bytes();
        let length = (content.len() as u16).to_be_bytes();
        self.stream
            .write_all(&[1, type_id, id[0], id[1], length[0], length[1], padding as u8, 0])
            .unwrap();
        self.stream.write_all(content).unwrap();
        self.stream.write_all(&vec![0u8; padding]).unwrap();
        self.stream.flush().unwrap();
    }

    pub fn begin_request(&mut self, request_id: u16, role: u16, keep_conn: bool) {
        let role = role.to_be_bytes();
        let flags = if keep_conn { 1 } else { 0 };
        self.send(
            FCGI_BEGIN_REQUEST,
            request_id,
            &[role[0], role[1], flags, 0, 0, 0, 0, 0],
        );
    }

    pub fn params(&mut self, request_id: u16, pairs: &[(&str, &str)]) {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
        let mut content = vec![];
        crate::record::pairs::encode(&map, &mut content);
        self.send(FCGI_PARAMS, request_id, &content);
    }

    pub fn end_params(&mut self, request_id: u16) {
        self.send(FCGI_PARAMS, request_id, &[]);
    }

    pub fn stdin(&mut self, request_id: u16, data: &[u8]) {
        for chunk in data.chunks(60_000) {
            self.send(FCGI_STDIN, request_id, chunk);
        }
    }

    pub fn end_stdin(&mut self, request_id: u16) {
        self.send(FCGI_STDIN, request_id, &[]);
    }

    pub fn data(&mut self, request_id: u16, data: &[u8]) {
        for chunk in data.chunks(60_000) {
            self.send(FCGI_DATA, request_id, chunk);
        }
    }

    pub fn end_data(&mut self, request_id: u16) {
        self.send(FCGI_DATA, request_id, &[]);
    }

    pub fn abort_request(&mut self, request_id: u16) {
        self.send(FCGI_ABORT_REQUEST, request_id, &[]);
    }

    pub fn get_values(&mut self, names: &[&str]) {
        let map: BTreeMap<String, String> =
            names.iter().map(|n| (n.to_string(), String::new())).collect();
        let mut content = vec![];
        crate::record::pairs::encode(&map, &mut content);
        self.send(FCGI_GET_VALUES, 0, &content);
    }

    /// Reads one frame, checking the framing invariants on the way.
    pub fn read_frame(&mut self) -> io::Result<Frame> {
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header)?;

        let [version, type_id, id_1, id_0, len_1, len_0, padding, reserved] = header;
        assert_eq!(version, 1);
        assert_eq!(reserved, 0);

        let length = u16::from_be_bytes([len_1, len_0]) as usize;
        let padding = padding as usize;
        assert_eq!((length + padding) % 8, 0, "unaligned record");

        let mut content = vec![0u8; length];
        self.stream.read_exact(&mut content)?;
        let mut pad = vec![0u8; padding];
        self.stream.read_exact(&mut pad)?;
        assert!(pad.iter().all(|b| *b == 0), "non-zero padding");

        Ok(Frame {
            type_id,
            request_id: u16::from_be_bytes([id_1, id_0]),
            content,
        })
    }

    pub fn read_frame_ok(&mut self) -> Frame {
        self.read_frame().expect("engine closed the connection")
    }

    /// Reads frames until every id in `ids` saw its `END_REQUEST`.
    ///
    /// Panics on a frame for an id that already ended, which is how tests
    /// enforce that `END_REQUEST` is the last record of a session.
    pub fn collect_sessions(&mut self, ids: &[u16]) -> HashMap<u16, SessionOutput> {
        let mut outputs: HashMap<u16, SessionOutput> = ids
            .iter()
            .map(|id| (*id, SessionOutput::default()))
            .collect();

        while outputs.values().any(|o| o.end.is_none()) {
            let frame = self.read_frame_ok();
            let output = outputs
                .get_mut(&frame.request_id)
                .unwrap_or_else(|| panic!("frame for unexpected id {}", frame.request_id));
            assert!(
                output.end.is_none(),
                "frame with type {} for id {} after its END_REQUEST",
                frame.type_id,
                frame.request_id
            );

            match frame.type_id {
                FCGI_STDOUT => {
                    if frame.content.is_empty() {
                        output.stdout_ended = true;
                    } else {
                        assert!(!output.stdout_ended, "stdout data after end-of-stream");
                        output.stdout.extend_from_slice(&frame.content);
                    }
                }
                FCGI_STDERR => {
                    if frame.content.is_empty() {
                        output.stderr_ended = true;
                    } else {
                        assert!(!output.stderr_ended, "stderr data after end-of-stream");
                        output.stderr.extend_from_slice(&frame.content);
                    }
                }
                FCGI_END_REQUEST => {
                    output.end = Some(EndRequest::from_content(&frame.content).unwrap());
                }
                other => panic!("unexpected record type {other}"),
            }
        }
        outputs
    }

    pub fn collect_session(&mut self, request_id: u16) -> SessionOutput {
        let mut outputs = self.collect_sessions(&[request_id]);
        outputs.remove(&request_id).unwrap()
    }

    /// Reads the reply to a `GET_VALUES` query.
    pub fn read_values(&mut self) -> BTreeMap<String, String> {
        let frame = self.read_frame_ok();
        assert_eq!(frame.type_id, FCGI_GET_VALUES_RESULT);
        assert_eq!(frame.request_id, 0);

        let mut values = BTreeMap::new();
        let mut decoder = PairDecoder::new(Vec::new());
        decoder.push(&frame.content, &mut |name, value| {
            values.insert(name, value);
        });
        let (_, residue) = decoder.finish();
        assert_eq!(residue, 0);
        values
    }

    /// Asserts the engine has closed its end of the connection.
    pub fn expect_closed(&mut self) {
        match self.read_frame() {
            Err(_) => {}
            Ok(frame) => panic!(
                "expected a closed connection, read record type {}",
                frame.type_id
            ),
        }
    }
}
