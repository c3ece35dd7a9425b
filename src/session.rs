//! One active connection, wrapped so the rest of the system never touches
//! raw sockets. A session splits into a reader half (owned by the
//! connection's reader task) and a writer half (the handle the registry or
//! coordinator keeps). Any I/O or decode error surfaced here means the
//! connection is gone; callers tear down rather than retry.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::message::{read_message, write_message, Message};

pub struct Session {
    reader: SessionReader,
    writer: SessionWriter,
}

impl Session {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self {
            reader: SessionReader {
                inner: BufReader::new(reader),
            },
            writer: SessionWriter { inner: writer, peer },
        }
    }

    /// Serializes and flushes `message`; the peer observes it whole or not
    /// at all.
    pub async fn send(&mut self, message: &Message) -> io::Result<()> {
        self.writer.send(message).await
    }

    /// Blocks until one complete message arrives. `Ok(None)` means the peer
    /// closed the connection cleanly.
    pub async fn receive_next(&mut self) -> io::Result<Option<Message>> {
        self.reader.receive_next().await
    }

    pub fn into_split(self) -> (SessionReader, SessionWriter) {
        (self.reader, self.writer)
    }
}

pub struct SessionReader {
    inner: BufReader<OwnedReadHalf>,
}

impl SessionReader {
    pub async fn receive_next(&mut self) -> io::Result<Option<Message>> {
        read_message(&mut self.inner).await
    }
}

pub struct SessionWriter {
    inner: OwnedWriteHalf,
    peer: Option<SocketAddr>,
}

impl SessionWriter {
    pub async fn send(&mut self, message: &Message) -> io::Result<()> {
        write_message(&mut self.inner, message).await
    }

    /// Shuts the stream down. The peer's in-flight read fails, which is its
    /// normal teardown signal, so a failure to close cleanly is only worth a
    /// debug line.
    pub async fn close(&mut self) {
        if let Err(error) = self.inner.shutdown().await {
            debug!(peer = ?self.peer, ?error, "session did not close cleanly");
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
