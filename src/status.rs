//! HTTP status code constants and reason phrases

macro_rules! status_codes {
    ($($name:ident  $value:literal  $phrase:literal),* $(,)?) => {
        $(
            pub const $name: u16 = $value;
        )*

        pub(crate) fn reason_phrase(code: u16) -> Option<&'static str> {
            match code {
                $($value => Some($phrase),)*
                _ => None,
            }
        }
    }
}

status_codes! {
    CONTINUE                    100  "Continue",
    SWITCHING_PROTOCOLS         101  "Switching Protocols",
    OK                          200  "OK",
    CREATED                     201  "Created",
    ACCEPTED                    202  "Accepted",
    NO_CONTENT                  204  "No Content",
    PARTIAL_CONTENT             206  "Partial Content",
    MOVED_PERMANENTLY           301  "Moved Permanently",
    FOUND                       302  "Found",
    SEE_OTHER                   303  "See Other",
    NOT_MODIFIED                304  "Not Modified",
    TEMPORARY_REDIRECT          307  "Temporary Redirect",
    PERMANENT_REDIRECT          308  "Permanent Redirect",
    BAD_REQUEST                 400  "Bad Request",
    UNAUTHORIZED                401  "Unauthorized",
    FORBIDDEN                   403  "Forbidden",
    NOT_FOUND                   404  "Not Found",
    METHOD_NOT_ALLOWED          405  "Method Not Allowed",
    NOT_ACCEPTABLE              406  "Not Acceptable",
    REQUEST_TIMEOUT             408  "Request Timeout",
    CONFLICT                    409  "Conflict",
    GONE                        410  "Gone",
    LENGTH_REQUIRED             411  "Length Required",
    PAYLOAD_TOO_LARGE           413  "Payload Too Large",
    UNSUPPORTED_MEDIA_TYPE      415  "Unsupported Media Type",
    TEAPOT                      418  "I'm a Teapot",
    TOO_MANY_REQUESTS           429  "Too Many Requests",
    INTERNAL_SERVER_ERROR       500  "Internal Server Error",
    NOT_IMPLEMENTED             501  "Not Implemented",
    BAD_GATEWAY                 502  "Bad Gateway",
    SERVICE_UNAVAILABLE         503  "Service Unavailable",
    GATEWAY_TIMEOUT             504  "Gateway Timeout",
    HTTP_VERSION_NOT_SUPPORTED  505  "HTTP Version Not Supported",
}

/// Renders the `<code> <reason>` part of a CGI status line.
///
/// Codes without a canonical phrase get the literal `UNKNOWN-RESPONSE-<code>`.
pub(crate) fn status_line(code: u16) -> String {
    match reason_phrase(code) {
        Some(phrase) => format!("{code} {phrase}"),
        None => format!("{code} UNKNOWN-RESPONSE-{code}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_have_phrases() {
        assert_eq!(status_line(OK), "200 OK");
        assert_eq!(status_line(NOT_FOUND), "404 Not Found");
        assert_eq!(status_line(UNAUTHORIZED), "401 Unauthorized");
    }

    #[test]
    fn unknown_codes_get_a_placeholder_phrase() {
        assert_eq!(status_line(299), "299 UNKNOWN-RESPONSE-299");
        assert_eq!(reason_phrase(299), None);
    }
}
