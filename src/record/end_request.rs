use super::ProtocolStatus;

// END_REQUEST body: appStatus(4, big-endian, signed), protocolStatus(1),
// reserved(3).
#[cfg(test)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndRequest {
    pub app_status: i32,
    pub protocol_status: ProtocolStatus,
}

#[cfg(test)]
impl EndRequest {
    pub fn from_content(content: &[u8]) -> Option<Self> {
        let body: [u8; 8] = content.try_into().ok()?;

        let app_status = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let protocol_status = ProtocolStatus::from_id(body[4])?;
        Some(Self {
            app_status,
            protocol_status,
        })
    }
}

pub(super) fn to_content(app_status: i32, protocol_status: ProtocolStatus) -> [u8; 8] {
    let code = app_status.to_be_bytes();
    [
        code[0],
        code[1],
        code[2],
        code[3],
        protocol_status.id(),
        0,
        0,
        0,
    ]
}
