use alloc::format;

use embedded_io::Write;

/// The kind of content carried by a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// An HTML page.
    Html,
    /// A JSON document.
    Json,
    /// Plain text.
    PlainText,
    /// A stylesheet.
    Css,
    /// A script.
    JavaScript,
    /// Arbitrary binary data.
    Binary,
}

impl ContentKind {
    /// Returns the MIME type.
    #[must_use]
    pub const fn mime(self) -> &'static str {
        match self {
            Self::Html => "text/html",
            Self::Json => "application/json",
            Self::PlainText => "text/plain",
            Self::Css => "text/css",
            Self::JavaScript => "text/javascript",
            Self::Binary => "application/octet-stream",
        }
    }
}

/// The header of a response whose total length is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader<'a> {
    /// HTTP status code.
    pub status: u16,
    /// Content kind.
    pub content_kind: ContentKind,
    /// Whether clients may cache the response.
    pub cacheable: bool,
    /// Value of the `Access-Control-Allow-Origin` header, if any.
    pub cors_origin: Option<&'a str>,
}

/// The network side of a stream.
///
/// The transport takes care of chunked transfer encoding, either natively or
/// through [`ChunkedWire`].
pub trait Transport {
    /// Transport error.
    type Error: core::fmt::Debug;

    /// Sends the response header.
    ///
    /// # Errors
    ///
    /// Fails when the connection is no longer usable.
    fn send_header(&mut self, header: &ResponseHeader<'_>) -> Result<(), Self::Error>;

    /// Sends one chunk of data.
    ///
    /// # Errors
    ///
    /// Fails when the connection is no longer usable.
    fn send_chunk(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Sends the zero-length end-of-stream chunk.
    ///
    /// # Errors
    ///
    /// Fails when the connection is no longer usable.
    fn send_terminator(&mut self) -> Result<(), Self::Error>;

    /// Sends a complete, fixed response in place of a stream.
    ///
    /// # Errors
    ///
    /// Fails when the connection is no longer usable.
    fn send_fallback(
        &mut self,
        status: u16,
        content_kind: ContentKind,
        body: &str,
    ) -> Result<(), Self::Error>;

    /// Returns the number of bytes the transport can currently accept
    /// without holding on to more memory.
    fn headroom(&self) -> usize;
}

/// Returns the reason phrase of an HTTP status code.
#[must_use]
pub const fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

// Longest size line: 16 hexadecimal digits followed by `\r\n`.
const SIZE_LINE_LENGTH: usize = 18;

fn size_line(mut len: usize) -> ([u8; SIZE_LINE_LENGTH], usize) {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";

    let mut digits = [0u8; 16];
    let mut count = 0;
    loop {
        digits[count] = DIGITS[len & 0x0F];
        count += 1;
        len >>= 4;
        if len == 0 {
            break;
        }
    }

    let mut line = [0u8; SIZE_LINE_LENGTH];
    for (index, digit) in digits[..count].iter().rev().enumerate() {
        line[index] = *digit;
    }
    line[count] = b'\r';
    line[count + 1] = b'\n';

    (line, count + 2)
}

/// A [`Transport`] writing raw `HTTP/1.1` over a byte writer, framing every
/// chunk by hand.
///
/// Used when the underlying server has no native chunked transfer support.
pub struct ChunkedWire<W: Write> {
    writer: W,
}

impl<W: Write> ChunkedWire<W> {
    /// Creates a [`ChunkedWire`] over a writer.
    #[must_use]
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Returns the underlying writer.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_status_line(
        &mut self,
        status: u16,
        content_kind: ContentKind,
    ) -> Result<(), W::Error> {
        let line = format!(
            "HTTP/1.1 {status} {}\r\nContent-Type: {}\r\nConnection: close\r\n",
            status_reason(status),
            content_kind.mime()
        );
        self.writer.write_all(line.as_bytes())
    }
}

impl<W: Write> Transport for ChunkedWire<W> {
    type Error = W::Error;

    fn send_header(&mut self, header: &ResponseHeader<'_>) -> Result<(), Self::Error> {
        self.write_status_line(header.status, header.content_kind)?;
        self.writer
            .write_all(b"Transfer-Encoding: chunked\r\nAccept-Ranges: none\r\n")?;

        if !header.cacheable {
            self.writer.write_all(b"Cache-Control: no-cache\r\n")?;
        }

        if let Some(origin) = header.cors_origin {
            self.writer.write_all(b"Access-Control-Allow-Origin: ")?;
            self.writer.write_all(origin.as_bytes())?;
            self.writer.write_all(b"\r\n")?;
        }

        self.writer.write_all(b"\r\n")
    }

    fn send_chunk(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        // A zero-length chunk would terminate the stream.
        if data.is_empty() {
            return Ok(());
        }

        let (line, len) = size_line(data.len());
        self.writer.write_all(&line[..len])?;
        self.writer.write_all(data)?;
        self.writer.write_all(b"\r\n")
    }

    fn send_terminator(&mut self) -> Result<(), Self::Error> {
        self.writer.write_all(b"0\r\n\r\n")?;
        self.writer.flush()
    }

    fn send_fallback(
        &mut self,
        status: u16,
        content_kind: ContentKind,
        body: &str,
    ) -> Result<(), Self::Error> {
        self.write_status_line(status, content_kind)?;
        let length = format!("Content-Length: {}\r\n\r\n", body.len());
        self.writer.write_all(length.as_bytes())?;
        self.writer.write_all(body.as_bytes())?;
        self.writer.flush()
    }

    fn headroom(&self) -> usize {
        // Every write completes before returning, nothing is ever held back.
        usize::MAX
    }
}
