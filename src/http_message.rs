//! Frames exactly one HTTP/1.1 message (request or response) from a byte
//! stream: header block up to Content-Length or chunked body, or
//! read-until-close for a response with neither.

use std::collections::HashMap;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("stream truncated before message was complete")]
    Truncated,
    #[error("malformed headers: {0}")]
    MalformedHeaders(String),
    #[error("invalid chunk size")]
    InvalidChunkSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// Parsed metadata plus the full raw bytes (headers + body) of one message.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub start_line: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub raw: Vec<u8>,
}

impl ParsedMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn status_code(&self) -> Option<u16> {
        self.start_line.split_whitespace().nth(1)?.parse().ok()
    }

    pub fn method(&self) -> Option<&str> {
        self.start_line.split_whitespace().next()
    }
}

/// Frames one HTTP/1.1 message from an async byte source.
pub struct HttpMessageReader;

impl HttpMessageReader {
    /// Read exactly one request from `stream`. Requests with neither
    /// Content-Length nor chunked encoding have no body, per spec.
    pub async fn read_request<R: AsyncRead + Unpin>(
        stream: &mut R,
    ) -> Result<ParsedMessage, FrameError> {
        Self::read(stream, MessageKind::Request).await
    }

    /// Read exactly one response from `stream`. A response with neither
    /// framing header is read until the connection closes.
    pub async fn read_response<R: AsyncRead + Unpin>(
        stream: &mut R,
    ) -> Result<ParsedMessage, FrameError> {
        Self::read(stream, MessageKind::Response).await
    }

    async fn read<R: AsyncRead + Unpin>(
        stream: &mut R,
        kind: MessageKind,
    ) -> Result<ParsedMessage, FrameError> {
        let mut buf = Vec::new();
        let header_end = loop {
            if let Some(pos) = find_header_terminator(&buf) {
                break pos;
            }
            if buf.len() > MAX_HEADER_BYTES {
                return Err(FrameError::MalformedHeaders("headers too large".into()));
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|_| FrameError::Truncated)?;
            if n == 0 {
                return Err(FrameError::Truncated);
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let header_block = &buf[..header_end];
        let header_text = String::from_utf8_lossy(header_block);
        let mut lines = header_text.split("\r\n");
        let start_line = lines.next().unwrap_or_default().to_string();
        if start_line.is_empty() {
            return Err(FrameError::MalformedHeaders("missing start line".into()));
        }

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(FrameError::MalformedHeaders(format!("bad header: {line}")));
            };
            headers.insert(
                name.trim().to_ascii_lowercase(),
                value.trim().to_string(),
            );
        }

        let mut body = buf[header_end + 4..].to_vec();

        if let Some(len) = headers.get("content-length") {
            let len: usize = len
                .trim()
                .parse()
                .map_err(|_| FrameError::MalformedHeaders("bad content-length".into()))?;
            read_exact_body(stream, &mut body, len).await?;
        } else if headers
            .get("transfer-encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
        {
            body = read_chunked_body(stream, body).await?;
        } else if kind == MessageKind::Response {
            read_until_close(stream, &mut body).await;
        }

        let mut raw = buf[..header_end + 4].to_vec();
        raw.extend_from_slice(&body);

        Ok(ParsedMessage {
            start_line,
            headers,
            body,
            raw,
        })
    }
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn read_exact_body<R: AsyncRead + Unpin>(
    stream: &mut R,
    body: &mut Vec<u8>,
    target_len: usize,
) -> Result<(), FrameError> {
    while body.len() < target_len {
        let mut chunk = [0u8; READ_CHUNK];
        let want = (target_len - body.len()).min(READ_CHUNK);
        let n = stream
            .read(&mut chunk[..want])
            .await
            .map_err(|_| FrameError::Truncated)?;
        if n == 0 {
            return Err(FrameError::Truncated);
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(target_len);
    Ok(())
}

/// `leftover` is whatever body bytes were already pulled into the header
/// read buffer; chunk parsing resumes from there.
async fn read_chunked_body<R: AsyncRead + Unpin>(
    stream: &mut R,
    leftover: Vec<u8>,
) -> Result<Vec<u8>, FrameError> {
    let mut pending = leftover;
    let mut out = Vec::new();

    loop {
        let size_line = read_line(stream, &mut pending).await?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| FrameError::InvalidChunkSize)?;

        if size == 0 {
            // Trailers, up to the final CRLF.
            loop {
                let trailer = read_line(stream, &mut pending).await?;
                if trailer.is_empty() {
                    break;
                }
            }
            break;
        }

        while pending.len() < size + 2 {
            fill(stream, &mut pending).await?;
        }
        out.extend_from_slice(&pending[..size]);
        if &pending[size..size + 2] != b"\r\n" {
            return Err(FrameError::InvalidChunkSize);
        }
        pending.drain(..size + 2);
    }

    Ok(out)
}

async fn read_line<R: AsyncRead + Unpin>(
    stream: &mut R,
    pending: &mut Vec<u8>,
) -> Result<String, FrameError> {
    loop {
        if let Some(pos) = pending.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = pending.drain(..pos + 2).collect();
            return Ok(String::from_utf8_lossy(&line[..line.len() - 2]).to_string());
        }
        fill(stream, pending).await?;
    }
}

async fn fill<R: AsyncRead + Unpin>(
    stream: &mut R,
    pending: &mut Vec<u8>,
) -> Result<(), FrameError> {
    let mut chunk = [0u8; READ_CHUNK];
    let n = stream
        .read(&mut chunk)
        .await
        .map_err(|_| FrameError::Truncated)?;
    if n == 0 {
        return Err(FrameError::Truncated);
    }
    pending.extend_from_slice(&chunk[..n]);
    Ok(())
}

async fn read_until_close<R: AsyncRead + Unpin>(stream: &mut R, body: &mut Vec<u8>) {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => body.extend_from_slice(&chunk[..n]),
        }
    }
}
