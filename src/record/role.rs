/// The part the web server asks the application to play for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Receives a request body on stdin, produces the response.
    Responder,
    /// Produces an allow/deny decision; has no input streams.
    Authorizer,
    /// Like a responder, plus a second `DATA` input stream to transform.
    Filter,
}

impl Role {
    pub(crate) fn id(&self) -> u16 {
        match self {
            Self::Responder => 1,
            Self::Authorizer => 2,
            Self::Filter => 3,
        }
    }

    pub(crate) fn from_id(id: u16) -> Option<Self> {
        match id {
            1 => Some(Self::Responder),
            2 => Some(Self::Authorizer),
            3 => Some(Self::Filter),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ids_round_trip() {
        for role in [Role::Responder, Role::Authorizer, Role::Filter] {
            assert_eq!(Role::from_id(role.id()), Some(role));
        }
        assert_eq!(Role::from_id(0), None);
        assert_eq!(Role::from_id(99), None);
    }
}
