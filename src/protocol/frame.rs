//! Newline-delimited framing with a frame-size cap.

use std::io::{BufRead, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },

    #[error("frame is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("frame payload contains the line delimiter")]
    EmbeddedDelimiter,
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Read the next `\n`-terminated frame. `Ok(None)` on clean EOF; EOF in
    /// the middle of a line is an error, as is a line over the size cap.
    pub fn read_next(&mut self) -> Result<Option<String>, FrameError> {
        let mut line = Vec::new();
        loop {
            let buf = self.reader.fill_buf()?;
            if buf.is_empty() {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame truncated at eof",
                )
                .into());
            }

            let (chunk, found) = match buf.iter().position(|b| *b == b'\n') {
                Some(at) => (&buf[..at], true),
                None => (buf, false),
            };
            if line.len() + chunk.len() > self.max_frame_bytes {
                return Err(FrameError::FrameTooLarge {
                    max_frame_bytes: self.max_frame_bytes,
                    got_bytes: line.len() + chunk.len(),
                });
            }
            line.extend_from_slice(chunk);
            let consumed = chunk.len() + usize::from(found);
            self.reader.consume(consumed);

            if found {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8(line)?));
            }
        }
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl FrameWriter<std::net::TcpStream> {
    pub fn shutdown(&self) {
        let _ = self.writer.shutdown(std::net::Shutdown::Both);
    }
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &str) -> Result<usize, FrameError> {
        if payload.len() > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: payload.len(),
            });
        }
        if payload.contains('\n') {
            return Err(FrameError::EmbeddedDelimiter);
        }
        self.writer.write_all(payload.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(payload.len() + 1)
    }
}
