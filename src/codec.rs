//! Framing codec for the dirfetch wire format
//!
//! See [`crate::protocol`] for the byte layout. Both decoders are
//! incremental: they accept whatever the socket read returned, keep their
//! position between calls, and produce the same result no matter where the
//! input was split.

use std::io::Write;

use crate::error::{Result, TransferError};
use crate::protocol::{MAX_NAME_LEN, MAX_REQUEST_LEN, NUL, SIZE_FIELD_LEN};

fn build_file_header(name: &str, size: u32) -> Result<Vec<u8>> {
    if name.is_empty() {
        return Err(TransferError::Protocol("file name must not be empty".into()));
    }
    if name.as_bytes().contains(&NUL) {
        return Err(TransferError::Protocol(format!(
            "file name contains NUL: {name:?}"
        )));
    }
    let mut buf = Vec::with_capacity(name.len() + 1 + SIZE_FIELD_LEN);
    buf.extend_from_slice(name.as_bytes());
    buf.push(NUL);
    buf.extend_from_slice(&size.to_be_bytes());
    Ok(buf)
}

/// Writes a file record header: the NUL-terminated name and the
/// big-endian size. Contents follow separately.
pub fn write_file_header<W: Write + ?Sized>(writer: &mut W, name: &str, size: u32) -> Result<()> {
    let hdr = build_file_header(name, size)?;
    writer
        .write_all(&hdr)
        .map_err(TransferError::ProtocolWrite)
}

/// Writes the terminal empty-name record.
pub fn write_completion_marker<W: Write + ?Sized>(writer: &mut W) -> Result<()> {
    writer
        .write_all(crate::protocol::COMPLETION_MARKER)
        .and_then(|_| writer.flush())
        .map_err(TransferError::ProtocolWrite)
}

/// Writes the client's directory request.
pub fn write_request<W: Write + ?Sized>(writer: &mut W, path: &str) -> Result<()> {
    if path.as_bytes().contains(&NUL) {
        return Err(TransferError::MalformedRequest("path contains NUL".into()));
    }
    let mut buf = Vec::with_capacity(path.len() + 1);
    buf.extend_from_slice(path.as_bytes());
    buf.push(NUL);
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// A decoded directory request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Requested directory, relative to the server root, no trailing `/`
    pub path: String,
    /// Byte offset in `path` where the client-visible part begins
    pub prefix_len: usize,
}

impl Request {
    /// Last component of the request, which prefixes every name sent back.
    pub fn display_root(&self) -> &str {
        &self.path[self.prefix_len..]
    }
}

/// Incremental decoder for the NUL-terminated request.
#[derive(Debug, Default)]
pub struct RequestDecoder {
    buf: Vec<u8>,
    last_slash: Option<usize>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one read's worth of bytes.
    ///
    /// Returns the request and the number of bytes consumed from `chunk`
    /// once the terminator has been seen, `None` while more input is needed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<(Request, usize)>> {
        for (i, &b) in chunk.iter().enumerate() {
            if b == NUL {
                let request = self.finish()?;
                return Ok(Some((request, i + 1)));
            }
            if b == b'/' {
                self.last_slash = Some(self.buf.len());
            }
            self.buf.push(b);
            if self.buf.len() > MAX_REQUEST_LEN {
                return Err(TransferError::MalformedRequest(format!(
                    "request exceeds {MAX_REQUEST_LEN} bytes"
                )));
            }
        }
        Ok(None)
    }

    fn finish(&mut self) -> Result<Request> {
        let raw = std::mem::take(&mut self.buf);
        let mut path = String::from_utf8(raw)
            .map_err(|e| TransferError::MalformedRequest(format!("path is not UTF-8: {e}")))?;

        let mut last_slash = self.last_slash.take();
        if path.ends_with('/') {
            let trimmed = path.trim_end_matches('/').len();
            path.truncate(trimmed);
            last_slash = path.rfind('/');
        }
        validate_request_path(&path)?;

        Ok(Request {
            prefix_len: last_slash.map_or(0, |pos| pos + 1),
            path,
        })
    }
}

fn validate_request_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(TransferError::MalformedRequest("empty path".into()));
    }
    if path.starts_with('/') {
        return Err(TransferError::MalformedRequest(format!(
            "absolute path not allowed: {path}"
        )));
    }
    if path.split('/').any(|c| c == "..") {
        return Err(TransferError::MalformedRequest(format!(
            "parent traversal not allowed: {path}"
        )));
    }
    Ok(())
}

/// Header of one file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub size: u32,
}

/// Event produced by [`ResponseDecoder::feed`].
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Header(FileHeader),
    /// Some of the current file's contents; boundaries carry no meaning
    Contents(&'a [u8]),
    /// All `size` bytes of the current file have been delivered
    EndOfFile,
    /// Completion marker seen; nothing may follow
    Complete,
}

fn check_name_len(len: usize) -> Result<()> {
    if len > MAX_NAME_LEN {
        return Err(TransferError::Protocol(format!(
            "file name exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

#[derive(Debug)]
enum DecodeState {
    ReadingName,
    ReadingSize { name: String },
    ReadingContents { remaining: u32 },
    Done,
}

/// Incremental decoder for the server's response stream.
#[derive(Debug)]
pub struct ResponseDecoder {
    state: DecodeState,
    name_buf: Vec<u8>,
    size_buf: [u8; SIZE_FIELD_LEN],
    size_filled: usize,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::ReadingName,
            name_buf: Vec::new(),
            size_buf: [0; SIZE_FIELD_LEN],
            size_filled: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, DecodeState::Done)
    }

    /// Feeds one read's worth of bytes, calling `on_frame` for each event.
    pub fn feed<F>(&mut self, mut input: &[u8], mut on_frame: F) -> Result<()>
    where
        F: FnMut(Frame<'_>) -> Result<()>,
    {
        while !input.is_empty() {
            match &mut self.state {
                DecodeState::ReadingName => match input.iter().position(|&b| b == NUL) {
                    Some(end) => {
                        check_name_len(self.name_buf.len() + end)?;
                        self.name_buf.extend_from_slice(&input[..end]);
                        input = &input[end + 1..];
                        if self.name_buf.is_empty() {
                            self.state = DecodeState::Done;
                            on_frame(Frame::Complete)?;
                            continue;
                        }
                        let raw = std::mem::take(&mut self.name_buf);
                        let name = String::from_utf8(raw).map_err(|e| {
                            TransferError::Protocol(format!("file name is not UTF-8: {e}"))
                        })?;
                        self.state = DecodeState::ReadingSize { name };
                    }
                    None => {
                        check_name_len(self.name_buf.len() + input.len())?;
                        self.name_buf.extend_from_slice(input);
                        input = &[];
                    }
                },
                DecodeState::ReadingSize { name } => {
                    let take = (SIZE_FIELD_LEN - self.size_filled).min(input.len());
                    self.size_buf[self.size_filled..self.size_filled + take]
                        .copy_from_slice(&input[..take]);
                    self.size_filled += take;
                    input = &input[take..];
                    if self.size_filled == SIZE_FIELD_LEN {
                        let size = u32::from_be_bytes(self.size_buf);
                        let name = std::mem::take(name);
                        self.size_filled = 0;
                        on_frame(Frame::Header(FileHeader { name, size }))?;
                        if size == 0 {
                            self.state = DecodeState::ReadingName;
                            on_frame(Frame::EndOfFile)?;
                        } else {
                            self.state = DecodeState::ReadingContents { remaining: size };
                        }
                    }
                }
                DecodeState::ReadingContents { remaining } => {
                    let take = (*remaining as usize).min(input.len());
                    *remaining -= take as u32;
                    let finished = *remaining == 0;
                    let (data, rest) = input.split_at(take);
                    input = rest;
                    on_frame(Frame::Contents(data))?;
                    if finished {
                        self.state = DecodeState::ReadingName;
                        on_frame(Frame::EndOfFile)?;
                    }
                }
                DecodeState::Done => {
                    return Err(TransferError::Protocol(format!(
                        "{} bytes after completion marker",
                        input.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Called when the stream hits EOF. Anything short of a completed
    /// transfer means the server went away.
    pub fn finish(&self) -> Result<()> {
        if self.is_done() {
            Ok(())
        } else {
            Err(TransferError::ConnectionClosed)
        }
    }
}
