//! Header block detection and parsing over a growing request buffer.
//!
//! # Responsibilities
//! - Find the blank line that ends the header block, even when the CRLF pair
//!   straddles chunk boundaries
//! - Parse the request line and the header lines into a [`RequestHead`]
//!
//! The scanner never consumes or splits the buffer: body bytes that arrive
//! with the final header chunk stay where they are so the forward path can
//! relay the stream verbatim.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

const TERMINATOR: &[u8] = b"\r\n\r\n";
const CRLF: &str = "\r\n";

/// Incremental search state for the header block terminator.
#[derive(Debug, Default)]
pub struct HeaderBlockScanner {
    /// Buffer prefix already known not to contain the terminator.
    searched: usize,
}

impl HeaderBlockScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look for the header block terminator in the cumulative buffer.
    ///
    /// Returns the length of the header block, terminator included, once it
    /// is present. Each call resumes close to where the previous one stopped.
    pub fn scan(&mut self, buffer: &[u8]) -> Option<usize> {
        let start = self.searched.saturating_sub(TERMINATOR.len() - 1);
        if buffer.len() < start + TERMINATOR.len() {
            self.searched = buffer.len();
            return None;
        }

        match buffer[start..]
            .windows(TERMINATOR.len())
            .position(|window| window == TERMINATOR)
        {
            Some(pos) => {
                let end = start + pos + TERMINATOR.len();
                self.searched = end;
                Some(end)
            }
            None => {
                self.searched = buffer.len();
                None
            }
        }
    }
}

/// Errors raised while parsing a complete header block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeadError {
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("malformed header line (no colon): {0:?}")]
    MalformedHeaderLine(String),
}

/// The first line of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.target, self.version)
    }
}

/// Header name to value mapping.
///
/// Names keep the case they arrived with. A repeated name overwrites the
/// earlier value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders {
    inner: HashMap<String, String>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, returning the value it replaced.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.inner.insert(name.into(), value.into())
    }

    /// Exact-name lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(name).map(String::as_str)
    }

    /// Case-insensitive lookup, as HTTP header names compare.
    pub fn get_ignore_case(&self, name: &str) -> Option<&str> {
        self.get(name).or_else(|| {
            self.inner
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.inner
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RequestHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// A parsed request head: the request line plus its headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub request_line: RequestLine,
    pub headers: RequestHeaders,
}

/// Parse a complete header block as returned by [`HeaderBlockScanner::scan`].
pub fn parse_head(block: &[u8]) -> Result<RequestHead, HeadError> {
    let block = block.strip_suffix(TERMINATOR).unwrap_or(block);
    let text = String::from_utf8_lossy(block);
    let mut lines = text.split(CRLF);

    let first = lines.next().unwrap_or_default();
    let request_line = parse_request_line(first)?;

    let mut headers = RequestHeaders::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| HeadError::MalformedHeaderLine(line.to_string()))?;
        headers.insert(name, value.trim_start());
    }

    Ok(RequestHead {
        request_line,
        headers,
    })
}

fn parse_request_line(line: &str) -> Result<RequestLine, HeadError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) => Ok(RequestLine {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
        }),
        _ => Err(HeadError::MalformedRequestLine(line.to_string())),
    }
}
