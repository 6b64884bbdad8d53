//! Literal HTTP/1.1 response composition for locally answered requests.
//!
//! # Wire layout
//! ```text
//! HTTP/1.1 <code> <reason>\r\n
//! <caller headers, in order>\r\n
//! Connection: close\r\n
//! Date: <RFC 1123>\r\n
//! \r\n
//! <body fragments, concatenated>
//! ```

use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use hyper::StatusCode;

/// Renders rejection responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseComposer;

impl ResponseComposer {
    /// Compose a response stamped with the given time in its `Date` header.
    pub fn compose<'a, H, B>(status: StatusCode, headers: H, body: B, now: SystemTime) -> ComposedResponse
    where
        H: IntoIterator<Item = (&'a str, &'a str)>,
        B: IntoIterator<Item = &'a [u8]>,
    {
        let mut buf = BytesMut::with_capacity(256);

        buf.put_slice(b"HTTP/1.1 ");
        buf.put_slice(status.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        buf.put_slice(b"\r\n");

        for (name, value) in headers {
            put_header(&mut buf, name, value);
        }
        put_header(&mut buf, "Connection", "close");
        put_header(&mut buf, "Date", &httpdate::fmt_http_date(now));
        buf.put_slice(b"\r\n");

        for fragment in body {
            buf.put_slice(fragment);
        }

        ComposedResponse {
            status,
            bytes: buf.freeze(),
            released: false,
        }
    }
}

fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

/// A composed response awaiting hand-off.
///
/// Must be finished with [`ComposedResponse::release`] once its bytes have
/// been queued for delivery. Dropping it unreleased is logged.
#[derive(Debug)]
#[must_use = "a composed response must be released after it is sent"]
pub struct ComposedResponse {
    status: StatusCode,
    bytes: Bytes,
    released: bool,
}

impl ComposedResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The full wire representation. Cloning is a reference-count bump.
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Release the response buffer. Consumes the response so it can only
    /// happen once.
    pub fn release(mut self) -> Released {
        self.released = true;
        let released = Released {
            status: self.status,
            bytes: self.bytes.len(),
        };
        tracing::trace!(status = %self.status, bytes = released.bytes, "Response released");
        released
    }
}

impl Drop for ComposedResponse {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(status = %self.status, "Composed response dropped without release");
        }
    }
}

/// Receipt of a released response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    pub status: StatusCode,
    pub bytes: usize,
}
