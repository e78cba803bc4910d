//! JSON-RPC framing codec.
//!
//! Language servers speak `Content-Length: N\r\n\r\n{json}` over stdio.
//! [`FrameReader`] and [`FrameWriter`] handle the header/body framing on any
//! async byte stream; everything above this layer deals in
//! [`serde_json::Value`] messages.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single frame body. Large TypeScript projects publish
/// sizeable diagnostics batches, but anything past this is a broken server.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Reads framed JSON-RPC messages from an async byte stream.
pub struct FrameReader<R> {
    input: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: BufReader::new(input),
            line: String::new(),
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` on a clean EOF between frames. EOF inside a frame,
    /// malformed headers, or an oversized body are errors.
    pub async fn read_message(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(body_len) = self.read_content_length().await? else {
            return Ok(None);
        };

        if body_len > MAX_FRAME_BYTES {
            bail!("frame of {body_len} bytes exceeds the {MAX_FRAME_BYTES} byte limit");
        }

        let mut body = vec![0u8; body_len];
        self.input
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;

        serde_json::from_slice(&body)
            .context("parsing frame body as JSON")
            .map(Some)
    }

    /// Consume header lines up to the blank separator, returning the
    /// `Content-Length` value or `None` on EOF before any header byte.
    async fn read_content_length(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut header_bytes = 0usize;

        loop {
            self.line.clear();
            let n = self
                .input
                .read_line(&mut self.line)
                .await
                .context("reading frame header")?;

            if n == 0 {
                // A clean shutdown ends exactly on a frame boundary. EOF
                // after a partial header block means the server died
                // mid-write, which callers need to hear about.
                if header_bytes == 0 {
                    return Ok(None);
                }
                bail!("stream ended inside frame headers");
            }
            header_bytes += n;

            let line = self.line.trim_ascii();
            if line.is_empty() {
                break;
            }

            if let Some((name, value)) = line.split_once(':')
                && name.trim_ascii().eq_ignore_ascii_case("content-length")
            {
                content_length = Some(
                    value
                        .trim_ascii()
                        .parse::<usize>()
                        .context("parsing Content-Length value")?,
                );
            }
            // Content-Type and anything else a server invents are skipped.
        }

        content_length
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("frame headers carried no Content-Length"))
    }
}

/// Writes framed JSON-RPC messages to an async byte stream.
pub struct FrameWriter<W> {
    output: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    /// Serialize `message` and write it as one header-plus-body frame.
    pub async fn write_message(&mut self, message: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("serializing frame body")?;
        // One buffered write per frame so a concurrent reader on the far end
        // never observes a header without its body.
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);
        self.output
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.output.flush().await.context("flushing frame")?;
        Ok(())
    }
}
