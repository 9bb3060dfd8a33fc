use std::str::FromStr;

use http::{Method, StatusCode, Uri};

use crate::{ErrorCode, Http3Error};

/// One header field. Names are kept lowercase; `never_index` marks fields
/// that must not enter a compression dynamic table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
    pub never_index: bool,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            value: value.into(),
            never_index: false,
        }
    }

    pub fn never_index(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            never_index: true,
            ..Self::new(name, value)
        }
    }

    pub fn size(&self) -> usize {
        self.name.len() + self.value.len()
    }
}

/// An ordered HTTP field section, in HTTP/3 shape (pseudo-headers first).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSection {
    fields: Vec<HeaderField>,
}

// Hop-by-hop fields that must not survive the 1.1 → 3 conversion.
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

impl FieldSection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: HeaderField) {
        self.fields.push(field);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.fields.iter()
    }

    pub fn is_request(&self) -> bool {
        self.get(":method").is_some()
    }

    pub fn is_response(&self) -> bool {
        self.get(":status").is_some()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")?.parse().ok()
    }

    /// Pseudo-headers must precede regular fields on the wire.
    pub fn sort_pseudo_first(&mut self) {
        self.fields.sort_by_key(|f| !f.name.starts_with(':'));
    }

    /// Parses a serialized HTTP/1.1 message head into HTTP/3 shape. Returns
    /// the section and the number of bytes consumed, or `None` until the
    /// terminating blank line has arrived.
    pub fn parse_http1(buf: &[u8]) -> Option<Result<(FieldSection, usize), Http3Error>> {
        let end = find_head_end(buf)?;
        Some(Self::parse_http1_head(&buf[..end]).map(|section| (section, end)))
    }

    fn parse_http1_head(head: &[u8]) -> Result<FieldSection, Http3Error> {
        let malformed = Http3Error::stream(ErrorCode::H3MessageError, "malformed message head");

        let text = std::str::from_utf8(head).map_err(|_| malformed)?;
        let mut lines = text.split("\r\n").filter(|l| !l.is_empty());
        let start_line = lines.next().ok_or(malformed)?;

        let mut section = FieldSection::new();
        let mut authority = None;

        if let Some(status) = start_line.strip_prefix("HTTP/1.1 ").or_else(|| start_line.strip_prefix("HTTP/1.0 ")) {
            // Status line: "HTTP/1.1 200 OK"
            let code = status.split_whitespace().next().ok_or(malformed)?;
            StatusCode::from_str(code).map_err(|_| malformed)?;
            section.push(HeaderField::new(":status", code));
        } else {
            // Request line: "GET /index.html HTTP/1.1"
            let mut parts = start_line.split_whitespace();
            let method = parts.next().ok_or(malformed)?;
            let target = parts.next().ok_or(malformed)?;
            Method::from_str(method).map_err(|_| malformed)?;

            section.push(HeaderField::new(":method", method));
            if method == "CONNECT" {
                authority = Some(target.to_string());
            } else if let Ok(uri) = Uri::from_str(target) {
                if let Some(a) = uri.authority() {
                    authority = Some(a.to_string());
                }
                let path = uri
                    .path_and_query()
                    .map_or_else(|| "/".to_string(), ToString::to_string);
                section.push(HeaderField::new(":scheme", "https"));
                section.push(HeaderField::new(":path", path));
            } else {
                section.push(HeaderField::new(":scheme", "https"));
                section.push(HeaderField::new(":path", target));
            }
        }

        for line in lines {
            let (name, value) = line.split_once(':').ok_or(malformed)?;
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            if name == "host" {
                if authority.is_none() {
                    authority = Some(value.to_string());
                }
                continue;
            }
            if CONNECTION_SPECIFIC.contains(&name.as_str()) {
                continue;
            }
            section.push(HeaderField::new(name, value));
        }

        if section.is_request() {
            section.push(HeaderField::new(
                ":authority",
                authority.unwrap_or_else(|| "localhost".to_string()),
            ));
        }

        section.sort_pseudo_first();
        Ok(section)
    }

    /// Serializes this section back into an HTTP/1.1 message head.
    pub fn to_http1(&self) -> Result<Vec<u8>, Http3Error> {
        let malformed = Http3Error::stream(ErrorCode::H3MessageError, "incomplete field section");
        let mut out = Vec::with_capacity(128);

        if let Some(status) = self.get(":status") {
            out.extend_from_slice(b"HTTP/1.1 ");
            out.extend_from_slice(status.as_bytes());
            out.extend_from_slice(b"\r\n");
        } else {
            let method = self.get(":method").ok_or(malformed)?;
            let path = self.get(":path").unwrap_or("/");
            out.extend_from_slice(method.as_bytes());
            out.push(b' ');
            out.extend_from_slice(path.as_bytes());
            out.extend_from_slice(b" HTTP/1.1\r\n");
            if let Some(authority) = self.get(":authority") {
                out.extend_from_slice(b"host: ");
                out.extend_from_slice(authority.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }

        for field in &self.fields {
            if field.name.starts_with(':') {
                continue;
            }
            out.extend_from_slice(field.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(field.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        Ok(out)
    }

    /// Builds an `http::Request` head from a request section.
    pub fn to_request(&self) -> Result<http::Request<()>, Http3Error> {
        let malformed = Http3Error::stream(ErrorCode::H3MessageError, "malformed request section");
        let method = Method::from_str(self.get(":method").ok_or(malformed)?).map_err(|_| malformed)?;
        let uri = Uri::builder()
            .scheme(self.get(":scheme").unwrap_or("https"))
            .authority(self.get(":authority").unwrap_or("localhost"))
            .path_and_query(self.get(":path").unwrap_or("/"))
            .build()
            .map_err(|_| malformed)?;

        let mut builder = http::Request::builder().method(method).uri(uri);
        for field in self.fields.iter().filter(|f| !f.name.starts_with(':')) {
            builder = builder.header(&field.name, &field.value);
        }
        builder.body(()).map_err(|_| malformed)
    }

    /// Builds an `http::Response` head from a response section.
    pub fn to_response(&self) -> Result<http::Response<()>, Http3Error> {
        let malformed = Http3Error::stream(ErrorCode::H3MessageError, "malformed response section");
        let status =
            StatusCode::from_str(self.get(":status").ok_or(malformed)?).map_err(|_| malformed)?;

        let mut builder = http::Response::builder().status(status);
        for field in self.fields.iter().filter(|f| !f.name.starts_with(':')) {
            builder = builder.header(&field.name, &field.value);
        }
        builder.body(()).map_err(|_| malformed)
    }
}

impl FromIterator<(String, String)> for FieldSection {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut section = FieldSection::new();
        for (name, value) in iter {
            section.push(HeaderField::new(name, value));
        }
        section
    }
}

/// Index just past the `\r\n\r\n` terminating a message head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}
