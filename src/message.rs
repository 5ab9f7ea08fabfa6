use std::fmt::{self, Display, Formatter};
use serde_json::Value;
use crate::def::*;

const NEWLINE: &'static str = "\r\n";
const PROTOCOL: &'static str = "HTTP/1.1";
const SERVER: &'static str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const CONTENT_LENGTH: &'static str = "content-length";
const CONTENT_TYPE: &'static str = "content-type";
const CONTENT_TYPE_TEXT: &'static str = "text/plain";
const CONTENT_TYPE_JSON: &'static str = "application/json";

pub struct Parameter {
    pub name: String,
    pub value: Option<String>
}

impl Parameter {
    pub fn parse(parameter: &str) -> Option<Self> {
        let mut pair = parameter.splitn(3, '=');
        let name = pair.next().filter(|n| !n.is_empty())?;
        let value = pair.next();
        if pair.next().is_some() { return None }

        Some(Self { name: name.to_string(), value: value.map(|v| v.to_string()) })
    }

    pub fn parse_many(parameters: &str) -> Vec<Self> {
        parameters.split('&').filter_map(Parameter::parse).collect()
    }
}

pub struct Headline<'a>(&'a str, &'a str, &'a str);

impl<'a> Headline<'a> {
    /// Exactly three whitespace separated tokens, nothing more.
    pub fn parse(line: &'a str) -> Result<Self, ParsingError> {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(first), Some(second), Some(third), None) => Ok(Headline(first, second, third)),
            _ => Err(ParsingError::Head)
        }
    }

    pub fn construct(first: impl Display, second: impl Display, third: impl Display) -> Vec<u8> {
        format!("{} {} {}{}", first, second, third, NEWLINE).into_bytes()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String
}

impl Header {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    pub fn parse(header: &str) -> Option<Self> {
        let (name, value) = header.split_once(':')?;
        Some(Self::new(name.trim(), value.trim()))
    }

    pub fn construct(&self) -> String {
        format!("{}: {}", self.name, self.value)
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.construct())
    }
}

/// Insertion ordered header map. Names are kept as given; adding an
/// existing name replaces its value without moving it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn add(&mut self, header: Header) {
        match self.0.iter_mut().find(|h| h.name == header.name) {
            Some(existing) => existing.value = header.value,
            None => self.0.push(header)
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|h| h.name == name).map(|h| h.value.as_str())
    }

    pub fn find(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|h| h.name.eq_ignore_ascii_case(name)).map(|h| h.value.as_str())
    }

    pub fn list(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn construct(&self) -> Vec<u8> {
        let mut headers = Vec::new();
        for header in self.list() {
            headers.extend(header.construct().as_bytes());
            headers.extend(NEWLINE.as_bytes());
        }

        headers
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub headers: Headers,
    pub body: String
}

impl Request {
    /// Parses one complete request.
    ///
    /// Lines end in `\n` or `\r\n`. Headers run until the first empty line and
    /// everything after it is the body, with the line breaks dropped.
    pub fn parse(raw: &[u8]) -> Result<Self, ParsingError> {
        let text = std::str::from_utf8(raw).or(Err(ParsingError::Encoding))?;
        let mut lines = text.lines();
        let Headline(method, path, protocol) = Headline::parse(lines.next().ok_or(ParsingError::Empty)?)?;

        let mut headers = Headers::new();
        let mut separated = false;
        for line in lines.by_ref() {
            if line.is_empty() {
                separated = true;
                break;
            }
            headers.add(Header::parse(line).ok_or(ParsingError::Header)?);
        }
        if !separated { Err(ParsingError::Separator)?; }

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            protocol: protocol.to_string(),
            body: lines.collect(),
            headers
        })
    }

    /// Total length of the request at the front of `buffer`, once its head
    /// has been received. Counts `content-length` body bytes if announced;
    /// an announced length past `usize::MAX` saturates.
    pub fn frame_len(buffer: &[u8]) -> Option<usize> {
        let head = [&b"\r\n\r\n"[..], &b"\n\n"[..]].iter()
            .filter_map(|sep| find(buffer, sep).map(|at| at + sep.len()))
            .min()?;
        let length = String::from_utf8_lossy(&buffer[..head]).lines()
            .filter_map(Header::parse)
            .find(|h| h.name.eq_ignore_ascii_case(CONTENT_LENGTH))
            .and_then(|h| h.value.parse::<usize>().ok())
            .unwrap_or(0);

        Some(head.saturating_add(length))
    }

    /// The path without its query string.
    pub fn location(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }

    pub fn query(&self) -> Vec<Parameter> {
        match self.path.split_once('?') {
            Some((_, query)) => Parameter::parse_many(query),
            None => Vec::new()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.find(name)
    }

    /// Decodes the body as JSON. A malformed body yields `None` when
    /// `failsafe` is set, otherwise a 400 exception.
    pub fn json(&self, failsafe: bool) -> Result<Option<Value>, HttpException> {
        match serde_json::from_str(&self.body) {
            Ok(value) => Ok(Some(value)),
            Err(_) if failsafe => Ok(None),
            Err(e) => Err(HttpException::bad_request(format!("Invalid JSON ({})", e)))
        }
    }
}

impl Display for Request {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub headers: Headers,
    pub body: String
}

impl Response {
    fn with_defaults(status: Status, body: String) -> Self {
        let mut headers = Headers::new();
        headers.add(Header::new("server", SERVER));
        headers.add(Header::new(CONTENT_TYPE, CONTENT_TYPE_TEXT));
        Self { status, headers, body }
    }

    /// Response whose body describes `status`, e.g. `404: Not Found: ...`.
    pub fn status(code: u16) -> Self {
        let status = Status(code);
        let (name, description) = status.lookup();
        let body = [status.to_string().as_str(), name, description].iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(": ");
        Self::with_defaults(status, body)
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::with_defaults(Status::OK, body.into())
    }

    pub fn json(value: &Value) -> Self {
        Self::text(value.to_string()).with_header(CONTENT_TYPE, CONTENT_TYPE_JSON)
    }

    pub fn with_status(mut self, code: u16) -> Self {
        self.status = Status(code);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(Header::new(name, value));
        self
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// Wire bytes. `content-length` is refreshed from the current body on
    /// every call.
    pub fn render(&mut self) -> Vec<u8> {
        self.headers.add(Header::new(CONTENT_LENGTH, self.body.len().to_string()));

        let mut response = Vec::new();
        response.extend(Headline::construct(PROTOCOL, self.status, self.status.name()));
        response.extend(self.headers.construct());
        response.extend(NEWLINE.as_bytes());
        response.extend(self.body.as_bytes());
        response.extend(NEWLINE.as_bytes());
        response
    }
}

/// Coerces a handler result into a [`Response`].
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response { self }
}

impl IntoResponse for String {
    fn into_response(self) -> Response { Response::text(self) }
}

impl IntoResponse for &str {
    fn into_response(self) -> Response { Response::text(self) }
}

impl IntoResponse for Value {
    fn into_response(self) -> Response { Response::json(&self) }
}

impl IntoResponse for Status {
    fn into_response(self) -> Response { Response::status(self.0) }
}

impl IntoResponse for () {
    fn into_response(self) -> Response { Response::status(200) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rendered(response: &mut Response) -> String {
        String::from_utf8(response.render()).unwrap()
    }

    #[test]
    fn parses_request_with_crlf() {
        let request = Request::parse(b"GET /users/5 HTTP/1.1\r\nHost: x\r\nAccept : */*\r\n\r\nhello").unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/users/5");
        assert_eq!(request.protocol, "HTTP/1.1");
        assert_eq!(request.headers.get("Host"), Some("x"));
        assert_eq!(request.headers.get("Accept"), Some("*/*"));
        assert_eq!(request.body, "hello");
    }

    #[test]
    fn parses_request_with_bare_lf_and_colon_in_value() {
        let request = Request::parse(b"POST / HTTP/1.0\nHost: localhost:8080\n\n{}").unwrap();
        assert_eq!(request.headers.get("Host"), Some("localhost:8080"));
        assert_eq!(request.body, "{}");
    }

    #[test]
    fn body_lines_are_joined_without_breaks() {
        let request = Request::parse(b"PUT / HTTP/1.1\r\n\r\n{\"a\":\r\n\r\n1}\r\n").unwrap();
        assert!(request.headers.is_empty());
        assert_eq!(request.body, "{\"a\":1}");
    }

    #[test]
    fn duplicate_headers_keep_last_value_and_first_position() {
        let request = Request::parse(b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nA: 3\r\n\r\n").unwrap();
        let names: Vec<_> = request.headers.list().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["A", "B"]);
        assert_eq!(request.headers.get("A"), Some("3"));
        assert_eq!(request.header("a"), Some("3"));
        assert_eq!(request.headers.get("a"), None);
    }

    #[test]
    fn rejects_malformed_requests() {
        assert_eq!(Request::parse(b""), Err(ParsingError::Empty));
        assert_eq!(Request::parse(b"GET /\r\n\r\n"), Err(ParsingError::Head));
        assert_eq!(Request::parse(b"GET / HTTP/1.1 extra\r\n\r\n"), Err(ParsingError::Head));
        assert_eq!(Request::parse(b"GET / HTTP/1.1\r\nHost: x\r\n"), Err(ParsingError::Separator));
        assert_eq!(Request::parse(b"GET / HTTP/1.1\r\nnocolon\r\n\r\n"), Err(ParsingError::Header));
        assert_eq!(Request::parse(b"GET / HTTP/1.1\r\n\r\n\xff"), Err(ParsingError::Encoding));
    }

    #[test]
    fn splits_query_from_location() {
        let request = Request::parse(b"GET /search?q=rust&page=2&flag HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.location(), "/search");
        let query = request.query();
        assert_eq!(query.len(), 3);
        assert_eq!(query[0].name, "q");
        assert_eq!(query[0].value.as_deref(), Some("rust"));
        assert_eq!(query[2].value, None);
    }

    #[test]
    fn frame_len_waits_for_head_and_body() {
        assert_eq!(Request::frame_len(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
        assert_eq!(Request::frame_len(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        let raw = b"PUT / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel";
        assert_eq!(Request::frame_len(raw), Some(raw.len() + 2));
        assert_eq!(Request::frame_len(b"GET / HTTP/1.1\n\n"), Some(16));
    }

    #[test]
    fn frame_len_saturates_on_huge_content_length() {
        let raw = b"GET / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert_eq!(Request::frame_len(raw), Some(usize::MAX));
        assert_eq!(Request::frame_len(b"GET / HTTP/1.1\r\nContent-Length: 99999999999999999999999\r\n\r\n"), Some(59));
    }

    #[test]
    fn json_failsafe_returns_none() {
        let request = Request::parse(b"PUT / HTTP/1.1\r\n\r\nnot json").unwrap();
        assert_eq!(request.json(true), Ok(None));
    }

    #[test]
    fn json_strict_raises_bad_request() {
        let request = Request::parse(b"PUT / HTTP/1.1\r\n\r\nnot json").unwrap();
        let exception = request.json(false).unwrap_err();
        assert_eq!(exception.status, Status::BAD_REQUEST);
        assert!(exception.message.starts_with("Invalid JSON ("));
    }

    #[test]
    fn json_decodes_body() {
        let request = Request::parse(b"PUT / HTTP/1.1\r\n\r\n{\"world\": \"hello\"}").unwrap();
        assert_eq!(request.json(false), Ok(Some(json!({"world": "hello"}))));
    }

    #[test]
    fn default_body_describes_status() {
        assert_eq!(Response::status(404).body,
            "404: Not Found: The requested page could not be found but may be available again in the future");
        assert_eq!(Response::status(460).body, "460: Client Error");
    }

    #[test]
    fn renders_wire_format() {
        let mut response = Response::text("hi");
        assert_eq!(rendered(&mut response), format!(
            "HTTP/1.1 200 OK\r\nserver: {}\r\ncontent-type: text/plain\r\ncontent-length: 2\r\n\r\nhi\r\n", SERVER));
    }

    #[test]
    fn render_is_deterministic() {
        let mut response = Response::status(201).with_header("x-id", "7");
        assert_eq!(response.render(), response.render());
    }

    #[test]
    fn content_length_tracks_body_mutation() {
        let mut response = Response::text("short");
        response.render();
        response.set_body("a much longer body");
        let wire = rendered(&mut response);
        assert!(wire.contains("content-length: 18\r\n"));
        assert_eq!(response.headers.get(CONTENT_LENGTH), Some("18"));
        assert_eq!(response.headers.len(), 3);
    }

    #[test]
    fn status_line_matches_code() {
        for code in [200, 301, 404, 418, 460, 500, 599] {
            let mut response = Response::status(code);
            let wire = rendered(&mut response);
            assert!(wire.starts_with(&format!("HTTP/1.1 {} {}\r\n", code, Status(code).name())));
        }
    }

    #[test]
    fn json_response_sets_content_type() {
        let response = json!({"hello": "world"}).into_response();
        assert_eq!(response.body, r#"{"hello":"world"}"#);
        assert_eq!(response.headers.get(CONTENT_TYPE), Some(CONTENT_TYPE_JSON));
    }
}
