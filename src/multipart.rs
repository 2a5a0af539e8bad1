//! Forward-only reader for ranged HTTP response bodies
//!
//! A multi-range GET comes back as `multipart/byteranges`: a boundary-
//! delimited sequence of body parts, each carrying a `Content-Range` header
//! naming the source offsets it covers. [`MultipartRangeReader`] walks that
//! body strictly forward: [`next_part`](MultipartRangeReader::next_part)
//! advances to the next section, and the reader itself is the
//! [`SourceStream`] for whichever section is current. A single-range 206
//! (or a 200 carrying the whole resource) surfaces as exactly one section.

use futures_util::TryStreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_util::io::StreamReader;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::range::SourceRange;
use crate::source::{SourceStream, discard_exact};

type Body = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

#[derive(Debug, Clone, Copy)]
enum PartState {
    /// Between sections
    Idle,
    /// Inside a section body: cursor position and exclusive end offset
    InPart { pos: u64, end: u64 },
    /// Closing delimiter (or the single section's end) reached
    Done,
}

enum ReaderKind {
    Single { range: SourceRange, yielded: bool },
    Multipart { boundary: String },
}

/// Reader over a `206 Partial Content` response body
pub struct MultipartRangeReader {
    input: Body,
    kind: ReaderKind,
    state: PartState,
}

impl MultipartRangeReader {
    /// Wrap a `multipart/byteranges` body with the given boundary
    pub fn multipart(boundary: impl Into<String>, body: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            input: BufReader::new(body),
            kind: ReaderKind::Multipart {
                boundary: boundary.into(),
            },
            state: PartState::Idle,
        }
    }

    /// Wrap a single-range body covering `range`
    pub fn single(range: SourceRange, body: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            input: BufReader::new(body),
            kind: ReaderKind::Single {
                range,
                yielded: false,
            },
            state: PartState::Idle,
        }
    }

    /// Wrap an HTTP response according to its content type and status
    ///
    /// `requested` is the range list the request carried; it anchors
    /// single-range responses that omit `Content-Range`.
    pub fn from_response(response: reqwest::Response, requested: &[SourceRange]) -> Result<Self> {
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let content_range = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();

        let body_stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        let body: Box<dyn AsyncRead + Send + Unpin> = Box::new(StreamReader::new(body_stream));

        if let Some(boundary) = multipart_boundary(&content_type) {
            return Ok(Self::multipart(boundary, body));
        }

        if status == reqwest::StatusCode::PARTIAL_CONTENT {
            let range = match content_range.as_deref() {
                Some(value) => parse_content_range(value)?,
                None => requested.first().copied().ok_or_else(|| {
                    Error::malformed_response("single-range response without Content-Range")
                })?,
            };
            return Ok(Self::single(range, body));
        }

        // Full-content fallback: the server ignored the Range header
        let end = content_length
            .filter(|&len| len > 0)
            .ok_or_else(|| Error::malformed_response("full response without a usable length"))?;
        Ok(Self::single(SourceRange::new(0, end), body))
    }

    /// Advance to the next body section
    ///
    /// Any unread remainder of the current section is discarded. Returns the
    /// section's source range, or `None` once the response is exhausted.
    pub async fn next_part(&mut self) -> Result<Option<SourceRange>> {
        // Drain whatever the caller left unread
        if let PartState::InPart { pos, end } = self.state {
            discard_exact(&mut self.input, end - pos).await?;
            self.state = PartState::Idle;
        }
        if matches!(self.state, PartState::Done) {
            return Ok(None);
        }

        match &mut self.kind {
            ReaderKind::Single { range, yielded } => {
                if *yielded {
                    self.state = PartState::Done;
                    return Ok(None);
                }
                *yielded = true;
                let range = *range;
                self.state = PartState::InPart {
                    pos: range.start,
                    end: range.end,
                };
                Ok(Some(range))
            }
            ReaderKind::Multipart { boundary } => {
                let delimiter = format!("--{boundary}");
                let closing = format!("--{boundary}--");

                // Find the next boundary line, skipping blank separator
                // lines (and any preamble before the first delimiter)
                loop {
                    let Some(line) = read_line(&mut self.input).await? else {
                        self.state = PartState::Done;
                        return Ok(None);
                    };
                    if line == closing {
                        self.state = PartState::Done;
                        return Ok(None);
                    }
                    if line == delimiter {
                        break;
                    }
                }

                // Section headers up to the blank line
                let mut content_range = None;
                loop {
                    let Some(line) = read_line(&mut self.input).await? else {
                        return Err(Error::malformed_response("truncated body part headers"));
                    };
                    if line.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        if name.trim().eq_ignore_ascii_case("content-range") {
                            content_range = Some(value.trim().to_string());
                        }
                    }
                }

                let range = parse_content_range(&content_range.ok_or_else(|| {
                    Error::malformed_response("body part without Content-Range")
                })?)?;
                self.state = PartState::InPart {
                    pos: range.start,
                    end: range.end,
                };
                Ok(Some(range))
            }
        }
    }
}

#[async_trait]
impl SourceStream for MultipartRangeReader {
    fn position(&self) -> u64 {
        match self.state {
            PartState::InPart { pos, .. } => pos,
            _ => 0,
        }
    }

    fn available_to(&self) -> u64 {
        match self.state {
            PartState::InPart { end, .. } => end,
            _ => 0,
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let PartState::InPart { pos, end } = self.state else {
            return Err(Error::invalid_argument("read outside of a body part"));
        };
        let len = buf.len() as u64;
        if pos + len > end {
            // The server delivered a shorter section than the part needs
            return Err(Error::malformed_response(format!(
                "read of {len} bytes at {pos} overruns the body part end {end}"
            )));
        }
        self.input.read_exact(buf).await?;
        self.state = PartState::InPart { pos: pos + len, end };
        Ok(())
    }

    async fn skip_to(&mut self, offset: u64) -> Result<()> {
        let PartState::InPart { pos, end } = self.state else {
            return Err(Error::invalid_argument("skip outside of a body part"));
        };
        if offset < pos {
            return Err(Error::invalid_argument(format!(
                "cannot seek backwards from {pos} to {offset} in a ranged response"
            )));
        }
        if offset > end {
            return Err(Error::invalid_argument(format!(
                "skip target {offset} is past the body part end {end}"
            )));
        }
        discard_exact(&mut self.input, offset - pos).await?;
        self.state = PartState::InPart { pos: offset, end };
        Ok(())
    }
}

/// Read one CRLF-terminated line, or `None` at end of input
async fn read_line(input: &mut Body) -> Result<Option<String>> {
    let mut raw = Vec::new();
    let n = input.read_until(b'\n', &mut raw).await?;
    if n == 0 {
        return Ok(None);
    }
    while raw.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
        raw.pop();
    }
    String::from_utf8(raw)
        .map(Some)
        .map_err(|_| Error::malformed_response("non-UTF-8 body part header"))
}

/// Extract the boundary parameter from a `multipart/byteranges` content type
fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut segments = content_type.split(';');
    if !segments.next()?.trim().eq_ignore_ascii_case("multipart/byteranges") {
        return None;
    }
    for param in segments {
        if let Some((name, value)) = param.split_once('=') {
            if name.trim().eq_ignore_ascii_case("boundary") {
                return Some(value.trim().trim_matches('"').to_string());
            }
        }
    }
    None
}

/// Parse `bytes <start>-<end>/<total>` into a half-open range
fn parse_content_range(value: &str) -> Result<SourceRange> {
    let malformed = || Error::malformed_response(format!("unparseable Content-Range: {value}"));

    let rest = value.trim().strip_prefix("bytes").ok_or_else(malformed)?.trim();
    let (span, _total) = rest.split_once('/').ok_or_else(malformed)?;
    let (start, end) = span.split_once('-').ok_or_else(malformed)?;

    let start: u64 = start.trim().parse().map_err(|_| malformed())?;
    let end: u64 = end.trim().parse().map_err(|_| malformed())?;
    if end < start {
        return Err(malformed());
    }
    Ok(SourceRange::new(start, end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn boxed(bytes: Vec<u8>) -> Box<dyn AsyncRead + Send + Unpin> {
        Box::new(Cursor::new(bytes))
    }

    fn two_part_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--BOUND\r\n");
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
        body.extend_from_slice(b"Content-Range: bytes 0-4/20\r\n");
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(b"hello");
        body.extend_from_slice(b"\r\n--BOUND\r\n");
        body.extend_from_slice(b"Content-Range: bytes 10-14/20\r\n");
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(b"world");
        body.extend_from_slice(b"\r\n--BOUND--\r\n");
        body
    }

    #[tokio::test]
    async fn walks_a_two_part_body() {
        let mut reader = MultipartRangeReader::multipart("BOUND", boxed(two_part_body()));

        let first = reader.next_part().await.unwrap().unwrap();
        assert_eq!(first, SourceRange::new(0, 5));
        assert_eq!(reader.available_to(), 5);
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let second = reader.next_part().await.unwrap().unwrap();
        assert_eq!(second, SourceRange::new(10, 15));
        assert_eq!(reader.position(), 10);
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        assert!(reader.next_part().await.unwrap().is_none());
        assert!(reader.next_part().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unread_remainder_is_drained_between_parts() {
        let mut reader = MultipartRangeReader::multipart("BOUND", boxed(two_part_body()));

        reader.next_part().await.unwrap().unwrap();
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"he");

        // Skipping the rest of "hello" must not desynchronize the parser
        let second = reader.next_part().await.unwrap().unwrap();
        assert_eq!(second, SourceRange::new(10, 15));
    }

    #[tokio::test]
    async fn forward_skip_within_a_part() {
        let mut reader = MultipartRangeReader::multipart("BOUND", boxed(two_part_body()));

        reader.next_part().await.unwrap().unwrap();
        reader.skip_to(3).await.unwrap();
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"lo");

        let err = reader.skip_to(1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn single_range_yields_exactly_one_part() {
        let mut reader =
            MultipartRangeReader::single(SourceRange::new(100, 105), boxed(b"abcde".to_vec()));

        let part = reader.next_part().await.unwrap().unwrap();
        assert_eq!(part, SourceRange::new(100, 105));
        assert_eq!(reader.position(), 100);
        assert_eq!(reader.available_to(), 105);

        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcde");

        assert!(reader.next_part().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_content_range_is_malformed() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--BOUND\r\n");
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(b"data\r\n--BOUND--\r\n");

        let mut reader = MultipartRangeReader::multipart("BOUND", boxed(body));
        let err = reader.next_part().await.unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn empty_body_is_exhausted_immediately() {
        let mut reader = MultipartRangeReader::multipart("BOUND", boxed(Vec::new()));
        assert!(reader.next_part().await.unwrap().is_none());
    }

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            multipart_boundary("multipart/byteranges; boundary=XYZ"),
            Some("XYZ".to_string())
        );
        assert_eq!(
            multipart_boundary("multipart/byteranges; boundary=\"quoted\""),
            Some("quoted".to_string())
        );
        assert_eq!(multipart_boundary("application/octet-stream"), None);
        assert_eq!(multipart_boundary("multipart/byteranges"), None);
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(
            parse_content_range("bytes 0-599/1024").unwrap(),
            SourceRange::new(0, 600)
        );
        assert_eq!(
            parse_content_range("bytes 10-14/*").unwrap(),
            SourceRange::new(10, 15)
        );
        assert!(parse_content_range("items 0-5/10").is_err());
        assert!(parse_content_range("bytes 5-1/10").is_err());
        assert!(parse_content_range("bytes x-y/10").is_err());
    }
}
