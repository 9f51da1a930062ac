//! RESP reply construction
//!
//! Handlers produce [`Reply`] values; the connection serializes them with
//! [`ReplyWriter`] after the surrounding transaction commits, so a failed
//! commit never leaks a success reply.

use bytes::BytesMut;
use itoa::Buffer;

/// A single RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    NullBulk,
    /// Array of bulk strings; `None` entries are nil bulks.
    BulkArray(Vec<Option<Vec<u8>>>),
    /// Heterogeneous array (EXEC replies).
    Array(Vec<Reply>),
    /// Nil array (aborted EXEC, WATCH conflict).
    NullArray,
}

impl Reply {
    pub fn ok() -> Reply {
        Reply::Simple("OK".to_string())
    }

    pub fn queued() -> Reply {
        Reply::Simple("QUEUED".to_string())
    }

    pub fn error(msg: impl Into<String>) -> Reply {
        Reply::Error(msg.into())
    }

    /// Array of plain bulk strings.
    pub fn bulks(items: Vec<Vec<u8>>) -> Reply {
        Reply::BulkArray(items.into_iter().map(Some).collect())
    }
}

/// Buffered reply serializer, flushed to the socket once per command.
pub struct ReplyWriter {
    buf: BytesMut,
}

impl ReplyWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Take the buffer, leaving an empty buffer in its place
    pub fn take(&mut self) -> BytesMut {
        std::mem::take(&mut self.buf)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write(&mut self, reply: &Reply) {
        match reply {
            Reply::Simple(s) => self.simple(s),
            Reply::Error(s) => self.error(s),
            Reply::Integer(n) => self.integer(*n),
            Reply::Bulk(data) => self.bulk(data),
            Reply::NullBulk => self.null_bulk(),
            Reply::BulkArray(items) => {
                self.array_header(items.len());
                for item in items {
                    match item {
                        Some(data) => self.bulk(data),
                        None => self.null_bulk(),
                    }
                }
            }
            Reply::Array(items) => {
                self.array_header(items.len());
                for item in items {
                    self.write(item);
                }
            }
            Reply::NullArray => self.buf.extend_from_slice(b"*-1\r\n"),
        }
    }

    fn simple(&mut self, msg: &str) {
        self.buf.extend_from_slice(b"+");
        self.buf.extend_from_slice(msg.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    fn error(&mut self, msg: &str) {
        self.buf.extend_from_slice(b"-");
        self.buf.extend_from_slice(msg.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    fn integer(&mut self, n: i64) {
        let mut itoa_buf = Buffer::new();
        self.buf.extend_from_slice(b":");
        self.buf.extend_from_slice(itoa_buf.format(n).as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    fn bulk(&mut self, data: &[u8]) {
        let mut itoa_buf = Buffer::new();
        self.buf.extend_from_slice(b"$");
        self.buf
            .extend_from_slice(itoa_buf.format(data.len()).as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\r\n");
    }

    fn null_bulk(&mut self) {
        self.buf.extend_from_slice(b"$-1\r\n");
    }

    fn array_header(&mut self, len: usize) {
        let mut itoa_buf = Buffer::new();
        self.buf.extend_from_slice(b"*");
        self.buf.extend_from_slice(itoa_buf.format(len).as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }
}

impl Default for ReplyWriter {
    fn default() -> Self {
        Self::new(4096)
    }
}
