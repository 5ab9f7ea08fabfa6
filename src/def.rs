use std::any::{type_name, Any};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::io;
use lazy_static::lazy_static;
use thiserror::Error;
use crate::message::Response;

const UNKNOWN_NAME: &'static str = "Unknown";
const UNKNOWN_DESCRIPTION: &'static str = "The meaning of this HTTP status is unknown.";

lazy_static! {
    static ref STATUSES: HashMap<u16, (&'static str, &'static str)> = [
        (100, ("Continue", "The server has received the request headers, and the client should proceed to send the request body")),
        (101, ("Switching Protocols", "The requester has asked the server to switch protocols")),
        (103, ("Checkpoint", "Used in the resumable requests proposal to resume aborted PUT or POST requests")),
        (200, ("OK", "The request is OK (this is the standard response for successful HTTP requests)")),
        (201, ("Created", "The request has been fulfilled, and a new resource is created")),
        (202, ("Accepted", "The request has been accepted for processing, but the processing has not been completed")),
        (203, ("Non-Authoritative Information", "The request has been successfully processed, but is returning information that may be from another source")),
        (204, ("No Content", "The request has been successfully processed, but is not returning any content")),
        (205, ("Reset Content", "The request has been successfully processed, but is not returning any content, and requires that the requester reset the document view")),
        (206, ("Partial Content", "The server is delivering only part of the resource due to a range header sent by the client")),
        (300, ("Multiple Choices", "A link list. The user can select a link and go to that location. Maximum five addresses")),
        (301, ("Moved Permanently", "The requested page has moved to a new URL")),
        (302, ("Found", "The requested page has moved temporarily to a new URL")),
        (303, ("See Other", "The requested page can be found under a different URL")),
        (304, ("Not Modified", "Indicates the requested page has not been modified since last requested")),
        (306, ("Switch Proxy", "-- No longer used --")),
        (307, ("Temporary Redirect", "The requested page has moved temporarily to a new URL")),
        (308, ("Resume Incomplete", "Used in the resumable requests proposal to resume aborted PUT or POST requests")),
        (400, ("Bad Request", "The request cannot be fulfilled due to bad syntax")),
        (401, ("Unauthorized", "The request was a legal request, but the server is refusing to respond to it. For use when authentication is possible but has failed or not yet been provided")),
        (402, ("Payment Required", "-- Reserved for future use --")),
        (403, ("Forbidden", "The request was a legal request, but the server is refusing to respond to it")),
        (404, ("Not Found", "The requested page could not be found but may be available again in the future")),
        (405, ("Method Not Allowed", "A request was made of a page using a request method not supported by that page")),
        (406, ("Not Acceptable", "The server can only generate a response that is not accepted by the client")),
        (407, ("Proxy Authentication Required", "The client must first authenticate itself with the proxy")),
        (408, ("Request Timeout", "The server timed out waiting for the request")),
        (409, ("Conflict", "The request could not be completed because of a conflict in the request")),
        (410, ("Gone", "The requested page is no longer available")),
        (411, ("Length Required", "The \"Content-Length\" is not defined. The server will not accept the request without it")),
        (412, ("Precondition Failed", "The precondition given in the request evaluated to false by the server")),
        (413, ("Request Entity Too Large", "The server will not accept the request, because the request entity is too large")),
        (414, ("Request-URI Too Long", "The server will not accept the request, because the URL is too long. Occurs when you convert a POST request to a GET request with a long query information")),
        (415, ("Unsupported Media Type", "The server will not accept the request, because the media type is not supported")),
        (416, ("Requested Range Not Satisfiable", "The client has asked for a portion of the file, but the server cannot supply that portion")),
        (417, ("Expectation Failed", "The server cannot meet the requirements of the Expect request-header field")),
        (418, ("I'm a teapot", "Any attempt to brew coffee with a teapot should result in the error code \"418 I'm a teapot\". The resulting entity body MAY be short and stout")),
        (421, ("Misdirected Request", "The request was directed at a server that is not able to produce a response (for example because a connection reuse)")),
        (422, ("Unprocessable Entity", "The request was well-formed but was unable to be followed due to semantic errors")),
        (423, ("Locked", "The resource that is being accessed is locked")),
        (424, ("Failed Dependency", "The request failed due to failure of a previous request (e.g., a PROPPATCH)")),
        (426, ("Upgrade Required", "The client should switch to a different protocol such as TLS/1.0, given in the Upgrade header field")),
        (428, ("Precondition Required", "The origin server requires the request to be conditional")),
        (429, ("Too Many Requests", "The user has sent too many requests in a given amount of time. Intended for use with rate limiting schemes")),
        (431, ("Request Header Fields Too Large", "The server is unwilling to process the request because either an individual header field, or all the header fields collectively, are too large")),
        (451, ("Unavailable For Legal Reasons", "A server operator has received a legal demand to deny access to a resource or to a set of resources that includes the requested resource")),
        (500, ("Internal Server Error", "An error has occured in a server side script, a no more specific message is suitable")),
        (501, ("Not Implemented", "The server either does not recognize the request method, or it lacks the ability to fulfill the request")),
        (502, ("Bad Gateway", "The server was acting as a gateway or proxy and received an invalid response from the upstream server")),
        (503, ("Service Unavailable", "The server is currently unavailable (overloaded or down)")),
        (504, ("Gateway Timeout", "The server was acting as a gateway or proxy and did not receive a timely response from the upstream server")),
        (505, ("HTTP Version Not Supported", "The server does not support the HTTP protocol version used in the request")),
        (511, ("Network Authentication Required", "The client needs to authenticate to gain network access")),
    ].iter().cloned().collect();
}

// class entries are keyed by the first decimal digit of the code
fn class(digit: char) -> Option<(&'static str, &'static str)> {
    match digit {
        '1' => Some(("Information", "")),
        '2' => Some(("Successful", "")),
        '3' => Some(("Redirection", "")),
        '4' => Some(("Client Error", "")),
        '5' => Some(("Server Error", "")),
        _ => None,
    }
}

/// An HTTP status code, resolved against the static status registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const BAD_REQUEST: Status = Status(400);
    pub const NOT_FOUND: Status = Status(404);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);

    pub fn code(&self) -> u16 {
        self.0
    }

    /// Returns `(name, description)`. Unknown codes fall back to their class
    /// entry, then to a generic unknown pair; this never fails.
    pub fn lookup(&self) -> (&'static str, &'static str) {
        if let Some(entry) = STATUSES.get(&self.0) {
            return *entry;
        }

        self.0.to_string().chars().next()
            .and_then(class)
            .unwrap_or((UNKNOWN_NAME, UNKNOWN_DESCRIPTION))
    }

    pub fn name(&self) -> &'static str {
        self.lookup().0
    }

    pub fn description(&self) -> &'static str {
        self.lookup().1
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParsingError {
    #[error("empty request")]
    Empty,
    #[error("request is not valid utf-8")]
    Encoding,
    #[error("malformed request line")]
    Head,
    #[error("malformed header line")]
    Header,
    #[error("missing blank line between headers and body")]
    Separator,
}

/// Expected failure that always turns into a response with `status`.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HttpException {
    pub status: Status,
    pub message: String,
}

impl HttpException {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self { status: Status(status), message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self { status: Status::BAD_REQUEST, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self { status: Status::NOT_FOUND, message: message.into() }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

/// Failure returned by a route handler.
///
/// Any error type converts into it, so handlers can use `?` freely. The
/// short type name of the original error is kept as the failure kind.
pub struct HandlerError {
    kind: &'static str,
    source: Box<dyn StdError + Send + Sync>,
}

impl HandlerError {
    pub fn msg(message: impl Display) -> Self {
        Self { kind: "Error", source: Box::new(Message(message.to_string())) }
    }

    /// Failure for a handler that panicked with `payload`.
    pub fn panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => payload.downcast_ref::<&str>().map_or("panic", |m| *m).to_string()
        };
        Self { kind: "Panic", source: Box::new(Message(message)) }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn message(&self) -> String {
        self.source.to_string()
    }

    pub(crate) fn into_exception(self) -> Result<HttpException, Self> {
        let kind = self.kind;
        self.source.downcast::<HttpException>()
            .map(|exception| *exception)
            .map_err(|source| Self { kind, source })
    }
}

impl<E: StdError + Send + Sync + 'static> From<E> for HandlerError {
    fn from(error: E) -> Self {
        Self { kind: short_type_name::<E>(), source: Box::new(error) }
    }
}

impl Debug for HandlerError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("HandlerError").field("kind", &self.kind).field("source", &self.source).finish()
    }
}

impl Display for HandlerError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.source)
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let name = type_name::<T>();
    let name = name.split('<').next().unwrap_or(name);
    name.rsplit("::").next().unwrap_or(name)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed request: {0}")]
    Parse(#[from] ParsingError),
    /// Handler failure surfaced in debug mode; `response` is the 500 reply
    /// that was built before propagating.
    #[error("{kind}: {message}")]
    Handler { kind: &'static str, message: String, response: Box<Response> },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid route pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}
