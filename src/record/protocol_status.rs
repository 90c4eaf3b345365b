/// The protocol-level verdict carried in an `END_REQUEST` record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolStatus {
    // Normal end of request.
    RequestComplete,
    // Sent when the web server multiplexes requests over a connection that
    // only accepts one at a time.
    CantMultiplex,
    // Sent when the application runs out of some resource.
    Overloaded,
    // Sent when the web server asked for a role the application does not
    // provide.
    UnknownRole,
}

impl ProtocolStatus {
    pub fn id(&self) -> u8 {
        match self {
            Self::RequestComplete => 0,
            Self::CantMultiplex => 1,
            Self::Overloaded => 2,
            Self::UnknownRole => 3,
        }
    }

    #[cfg(test)]
    pub fn from_id(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::RequestComplete),
            1 => Some(Self::CantMultiplex),
            2 => Some(Self::Overloaded),
            3 => Some(Self::UnknownRole),
            _ => None,
        }
    }
}
