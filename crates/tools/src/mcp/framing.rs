//! Per-message framing detection for the stdio transport.
//!
//! Clients may send bare newline-terminated JSON or LSP-style
//! `Content-Length` framed bodies, and may switch between them from one
//! message to the next. Responses are written back in the framing of the
//! request they answer.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use tabscope_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Line,
    ContentLength,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: String,
    pub framing: Framing,
}

/// `token: value` where token is letters, digits and hyphens.
fn is_header_line(line: &str) -> bool {
    match line.split_once(':') {
        Some((token, _)) => !token.is_empty() && token.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-'),
        None => false,
    }
}

fn strip_eol(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

pub struct FrameReader<R> {
    reader: R,
    max_content_length: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_content_length: usize) -> Self {
        Self {
            reader,
            max_content_length,
        }
    }

    /// Reads the next message. `Ok(None)` is a clean end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let first = loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let trimmed = strip_eol(&line).trim();
            if !trimmed.is_empty() {
                break trimmed.to_string();
            }
        };

        if !is_header_line(&first) {
            return Ok(Some(Frame {
                payload: first,
                framing: Framing::Line,
            }));
        }

        let mut content_length = header_content_length(&first);
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                break;
            }
            let header = strip_eol(&line);
            if header.trim().is_empty() {
                break;
            }
            if content_length.is_none() {
                content_length = header_content_length(header);
            }
        }

        let len = match content_length {
            Some(n) if n <= self.max_content_length => n,
            Some(n) => {
                warn!(len = n, max = self.max_content_length, "Content-Length over limit, treating header as message");
                return Ok(Some(Frame {
                    payload: first,
                    framing: Framing::Line,
                }));
            }
            None => {
                debug!("Header block without Content-Length, treating first line as message");
                return Ok(Some(Frame {
                    payload: first,
                    framing: Framing::Line,
                }));
            }
        };

        let mut body = vec![0u8; len];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(|e| Error::Transport(format!("truncated message body ({} bytes expected): {}", len, e)))?;
        let text = String::from_utf8(body)
            .map_err(|e| Error::Transport(format!("message body is not UTF-8: {}", e)))?;
        Ok(Some(Frame {
            payload: text.trim().to_string(),
            framing: Framing::ContentLength,
        }))
    }
}

fn header_content_length(line: &str) -> Option<usize> {
    let (name, value) = line.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse().ok()
}

pub fn encode_frame(payload: &str, framing: Framing) -> String {
    match framing {
        Framing::Line => format!("{}\n", payload),
        Framing::ContentLength => format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload),
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &str, framing: Framing) -> Result<()> {
    writer.write_all(encode_frame(payload, framing).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
