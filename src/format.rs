use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::block::{RefBlock, BLOCK_SYNC};
use crate::client::{Client, ClientIo};
use crate::config::MountConfig;
use crate::errors::FormatError;

/// Stream codec family; fallback and override only move listeners
/// between mounts carrying the same codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CodecType {
    Ogg,
    Mp3,
    Aac,
    Undefined,
}

/// Presentation details resolved from mount config and producer
/// headers, consumed when building listener response headers.
#[derive(Debug, Clone, Default)]
pub struct StreamDetails {
    pub mount: String,
    pub contenttype: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub genre: Option<String>,
    pub bitrate: Option<String>,
}

/// The codec seam. Implementations frame the producer's byte stream
/// into blocks, build per-listener response headers and push blocks out
/// to listener sockets. All calls happen under the owning source's lock.
pub trait FormatAdapter: Send {
    fn codec(&self) -> CodecType;

    fn contenttype(&self) -> &str;

    fn charset(&self) -> &str {
        "UTF-8"
    }

    /// Total bytes pulled off the producer.
    fn read_bytes(&self) -> u64;

    /// Read and reset the pull counter (hijack handoff).
    fn take_read_bytes(&mut self) -> u64;

    /// Pull the next codec-aligned block. `Ok(None)` means no complete
    /// block is available yet; sync-flagged blocks mark listener start
    /// points.
    fn get_buffer(&mut self, io: &mut dyn ClientIo) -> Result<Option<Arc<RefBlock>>, FormatError>;

    /// Build the HTTP response for a fresh listener into its refbuf.
    /// Implementations may chain seeded intro blocks behind it and set
    /// `CLIENT_HAS_INTRO_CONTENT`.
    fn create_client_data(
        &mut self,
        details: &StreamDetails,
        client: &mut Client,
    ) -> Result<(), FormatError> {
        general_headers(details, client);
        Ok(())
    }

    /// Push bytes from the client's current buffer to its socket.
    /// Returns bytes written, or -1 when no progress is possible.
    fn write_to_client(&mut self, client: &mut Client) -> i64 {
        generic_write_to_client(client)
    }

    fn write_to_file(&mut self, file: &mut File, block: &RefBlock) -> io::Result<()> {
        file.write_all(block.data())
    }

    fn apply_settings(&mut self, _mount: &MountConfig) {}

    /// Hijack handoff: adopt the incoming producer's request state.
    fn swap_producer(&mut self, _incoming: &mut Client) {}
}

/// Plain HTTP response when the adapter has nothing fancier.
pub fn general_headers(details: &StreamDetails, client: &mut Client) {
    let mut head = format!(
        "HTTP/1.0 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache\r\n",
        details.contenttype
    );
    if let Some(name) = &details.name {
        head.push_str(&format!("icy-name:{name}\r\n"));
    }
    if let Some(desc) = &details.description {
        head.push_str(&format!("icy-description:{desc}\r\n"));
    }
    if let Some(url) = &details.url {
        head.push_str(&format!("icy-url:{url}\r\n"));
    }
    if let Some(genre) = &details.genre {
        head.push_str(&format!("icy-genre:{genre}\r\n"));
    }
    if let Some(br) = &details.bitrate {
        head.push_str(&format!("icy-br:{br}\r\n"));
    }
    head.push_str("\r\n");
    client.set_queue(Some(RefBlock::new(Bytes::from(head), 0)));
    client.respcode = 200;
}

/// Write the remainder of the client's buffer to its socket, advancing
/// the cursor counters. Returns bytes written or -1 when the socket will
/// not take more (or has died; the error flag says which).
pub fn generic_write_to_client(client: &mut Client) -> i64 {
    let Some(buf) = client.refbuf.clone() else {
        return -1;
    };
    if client.pos >= buf.len() {
        return 0;
    }
    match client.io.write(&buf.data()[client.pos..]) {
        Ok(0) => -1,
        Ok(n) => {
            client.pos += n;
            client.connection.sent_bytes += n as u64;
            client.queue_pos += n as u64;
            n as i64
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => -1,
        Err(_) => {
            client.connection.error = true;
            -1
        }
    }
}

/// Load the next chunk of an intro (or other pre-encoded) file into the
/// client's buffer. Returns -1 at end of file, 0 otherwise. The current
/// buffer is drained before the file is consulted again.
pub fn file_read(client: &mut Client, file: &mut File) -> i64 {
    if let Some(buf) = &client.refbuf {
        if client.pos < buf.len() {
            return 0;
        }
    }
    if client.intro_offset < 0 {
        return -1;
    }
    let mut chunk = vec![0u8; 4096];
    let n = match file
        .seek(SeekFrom::Start(client.intro_offset as u64))
        .and_then(|_| file.read(&mut chunk))
    {
        Ok(n) => n,
        Err(_) => return -1,
    };
    if n == 0 {
        return -1;
    }
    chunk.truncate(n);
    client.set_queue(Some(RefBlock::new(Bytes::from(chunk), 0)));
    client.intro_offset += n as i64;
    0
}

/// Passthrough adapter: no reframing, every pulled block is a sync
/// point. Suits raw streams where any byte boundary is playable and
/// keeps the core exercisable without a codec.
pub struct RawAdapter {
    contenttype: String,
    codec: CodecType,
    chunk_size: usize,
    read_bytes: u64,
}

impl RawAdapter {
    pub fn new(codec: CodecType, contenttype: impl Into<String>) -> Self {
        Self {
            contenttype: contenttype.into(),
            codec,
            chunk_size: 4096,
            read_bytes: 0,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl FormatAdapter for RawAdapter {
    fn codec(&self) -> CodecType {
        self.codec
    }

    fn contenttype(&self) -> &str {
        &self.contenttype
    }

    fn read_bytes(&self) -> u64 {
        self.read_bytes
    }

    fn take_read_bytes(&mut self) -> u64 {
        std::mem::take(&mut self.read_bytes)
    }

    fn get_buffer(&mut self, io: &mut dyn ClientIo) -> Result<Option<Arc<RefBlock>>, FormatError> {
        let mut buf = vec![0u8; self.chunk_size];
        match io.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                buf.truncate(n);
                self.read_bytes += n as u64;
                Ok(Some(RefBlock::new(Bytes::from(buf), BLOCK_SYNC)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
