use percent_encoding::percent_decode_str;

use crate::error::{Error, ErrorKind, Result};

/// Maximum size of a request head, in bytes.
pub const MAX_HEAD_LEN: usize = 4096;

// Headers are parsed but not kept.
const MAX_HEADERS: usize = 32;

/// Request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `GET`
    Get,
    /// Any other method.
    Other,
}

/// The request line of an `HTTP/1.x` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
}

impl Request {
    /// Parses the head of a request from the bytes received so far.
    ///
    /// Returns `None` while the head is incomplete.
    ///
    /// # Errors
    ///
    /// Fails when the head is malformed or the path is not valid
    /// percent-encoded UTF-8.
    pub fn parse(received: &[u8]) -> Result<Option<Self>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        match request.parse(received) {
            Ok(httparse::Status::Partial) => return Ok(None),
            Ok(httparse::Status::Complete(_)) => {}
            Err(e) => {
                return Err(Error::new(
                    ErrorKind::BadRequest,
                    format!("malformed request head: {e}"),
                ));
            }
        }

        let method = match request.method {
            Some("GET") => Method::Get,
            _ => Method::Other,
        };

        let target = request.path.unwrap_or("/");
        let (path, query) = target.split_once('?').unwrap_or((target, ""));

        let path = percent_decode_str(path).decode_utf8().map_err(|_| {
            Error::new(ErrorKind::BadRequest, format!("invalid path `{path}`"))
        })?;
        let query = form_urlencoded::parse(query.as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        Ok(Some(Self {
            method,
            path: path.into_owned(),
            query,
        }))
    }

    /// Returns the request method.
    #[must_use]
    #[inline]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Returns the decoded path.
    #[must_use]
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the first decoded value of a query parameter.
    #[must_use]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}
