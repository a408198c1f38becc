//! Buffered line framing for the worker channel.
//!
//! Each frame is one line. Writers emit a whole frame and flush it under a
//! single call, so a frame is never split as long as each `LineWriter` has
//! one owner. On the parent side that owner is the dispatcher's writer
//! thread, which drains a FIFO queue of encoded frames.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::str::Utf8Error;

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Largest frame accepted from the peer (16 MiB).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Whether an encoded frame (with or without its trailing newline) is larger
/// than the peer will accept.
pub fn exceeds_frame_limit(line: &str) -> bool {
    line.strip_suffix('\n').unwrap_or(line).len() > MAX_FRAME_BYTES
}

/// One frame as read off the channel.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A UTF-8 line with its terminator stripped.
    Text(&'a str),
    /// A line whose bytes are not valid UTF-8. The channel stays usable.
    NotUtf8(Utf8Error),
}

/// Buffered line reader for IPC.
pub struct LineReader<R: Read> {
    reader: BufReader<R>,
    line_buffer: Vec<u8>,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, inner),
            line_buffer: Vec::with_capacity(4096),
        }
    }

    /// Read the next frame. Returns `None` on EOF.
    ///
    /// A frame longer than [`MAX_FRAME_BYTES`] is an `InvalidData` error:
    /// the rest of that line is still unread, so the stream cannot be
    /// resynchronized.
    pub fn read_frame(&mut self) -> io::Result<Option<Frame<'_>>> {
        self.line_buffer.clear();
        let limit = MAX_FRAME_BYTES as u64 + 1;
        let n = self
            .reader
            .by_ref()
            .take(limit)
            .read_until(b'\n', &mut self.line_buffer)?;
        if n == 0 {
            return Ok(None);
        }
        if self.line_buffer.last() != Some(&b'\n') && n as u64 >= limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {} bytes", MAX_FRAME_BYTES),
            ));
        }
        // Strip trailing newline
        if self.line_buffer.last() == Some(&b'\n') {
            self.line_buffer.pop();
        }
        if self.line_buffer.last() == Some(&b'\r') {
            self.line_buffer.pop();
        }
        Ok(Some(match std::str::from_utf8(&self.line_buffer) {
            Ok(text) => Frame::Text(text),
            Err(e) => Frame::NotUtf8(e),
        }))
    }

    /// Read a line, returning a reference to the internal buffer.
    /// Returns `None` on EOF; a non-UTF-8 line is an `InvalidData` error.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        match self.read_frame()? {
            None => Ok(None),
            Some(Frame::Text(text)) => Ok(Some(text)),
            Some(Frame::NotUtf8(e)) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }

    /// Read a line and return an owned string.
    /// Returns `None` on EOF.
    pub fn read_line_owned(&mut self) -> io::Result<Option<String>> {
        Ok(self.read_line()?.map(String::from))
    }
}

/// Buffered line writer for IPC.
pub struct LineWriter<W: Write> {
    writer: BufWriter<W>,
    frames_written: u64,
}

impl<W: Write> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, inner),
            frames_written: 0,
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()?;
        self.frames_written += 1;
        Ok(())
    }

    /// Number of frames successfully written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}
