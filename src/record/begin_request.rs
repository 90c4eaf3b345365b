const MASK_FCGI_KEEP_CONN: u8 = 0x01;

// The web server sends a BEGIN_REQUEST record to open a new request session.
// The body is fixed-size: role(2, big-endian), flags(1), reserved(5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequest {
    pub fn from_content(content: &[u8]) -> Option<Self> {
        let [role_1, role_0, flags, ..]: [u8; 8] = content.try_into().ok()?;

        Some(BeginRequest {
            role: u16::from_be_bytes([role_1, role_0]),
            flags,
        })
    }

    /// True when the web server intends to reuse this connection for more
    /// requests after this one completes.
    pub fn keep_conn(&self) -> bool {
        self.flags & MASK_FCGI_KEEP_CONN == 1
    }
}
