//! Control-channel codec: outbound command lines, inbound reply parsing.
//!
//! Replies are either a single `DDD text` line or a multi-line block
//! opened by `DDD-text` and closed by a line starting with the same code
//! followed by a space. Body lines are joined with `\n`, so callers like
//! the FEAT parser see the indented feature lines untouched.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub struct Codec<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> Codec<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Writes `line` terminated with CRLF as one buffer so the command
    /// hits the stream in a single write.
    pub async fn send_command(&mut self, line: &str) -> Result<()> {
        let mut wire = String::with_capacity(line.len() + 2);
        wire.push_str(line);
        wire.push_str("\r\n");
        self.writer.write_all(wire.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads one full reply. With `expected` set, a different final code
    /// is returned as [`Error::UnexpectedReply`] carrying the code and
    /// message; `None` accepts any code and leaves the check to the
    /// caller.
    pub async fn read_reply(&mut self, expected: Option<i32>) -> Result<(i32, String)> {
        let line = self.read_line().await?;
        let (code, text, continued) = parse_code_line(&line)
            .ok_or_else(|| Error::Protocol(format!("malformed reply line {line:?}")))?;
        let mut message = text.to_string();
        if continued {
            loop {
                let line = self.read_line().await?;
                match parse_code_line(&line) {
                    Some((c, text, false)) if c == code => {
                        message.push('\n');
                        message.push_str(text);
                        break;
                    }
                    // Continuation lines need not repeat the code.
                    _ => {
                        message.push('\n');
                        message.push_str(&line);
                    }
                }
            }
        }
        if let Some(want) = expected {
            if code != want {
                return Err(Error::UnexpectedReply { code, message });
            }
        }
        Ok((code, message))
    }

    /// Sends a command and reads the reply to it.
    pub async fn cmd(&mut self, expected: Option<i32>, line: &str) -> Result<(i32, String)> {
        self.send_command(line).await?;
        self.read_reply(expected).await
    }

    /// Shuts the write half down, signalling the server we are done.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Protocol("control stream closed mid-reply".into()));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}

/// Splits `DDD text` / `DDD-text` into (code, text, continued). `None`
/// for anything that does not start with a three-digit code.
fn parse_code_line(line: &str) -> Option<(i32, &str, bool)> {
    let bytes = line.as_bytes();
    if bytes.len() < 4 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code: i32 = line[..3].parse().ok()?;
    match bytes[3] {
        b' ' => Some((code, &line[4..], false)),
        b'-' => Some((code, &line[4..], true)),
        _ => None,
    }
}
