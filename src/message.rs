//! Wire protocol: the tagged message union and its line-delimited JSON
//! framing. Every logical unit on a connection is one serialized [`Message`]
//! terminated by a newline; the `type` field is the discriminant, read
//! before any other field is interpreted.

use std::io;

use chrono::Local;
use num_bigint::BigUint;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::keys::PublicKey;

/// Bumped on any incompatible change to the message set. Carried in the
/// handshake so mismatched peers part ways at the front door instead of
/// misreading each other mid-session.
pub const PROTOCOL_VERSION: u32 = 1;

/// Reserved sender name for relay-originated notices.
pub const SERVER_NAME: &str = "server";

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// A participant as seen on the wire. The public key is absent for
/// broadcast-only senders and for the server itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
}

impl Identity {
    pub fn new(name: impl Into<String>, public_key: Option<PublicKey>) -> Self {
        Self {
            name: name.into(),
            public_key,
        }
    }

    pub fn server() -> Self {
        Self::new(SERVER_NAME, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First message in both directions: the client proposes an identity,
    /// the server echoes it back with `accepted` set.
    Handshake {
        sender: Identity,
        timestamp: String,
        version: u32,
        accepted: bool,
    },
    /// Full replacement of the peer roster, server to all clients.
    RosterUpdate {
        sender: Identity,
        timestamp: String,
        identities: Vec<Identity>,
    },
    /// End-to-end encrypted payload for one named recipient. The relay
    /// forwards the cipher blocks untouched.
    Direct {
        sender: Identity,
        timestamp: String,
        recipient: String,
        cipher_blocks: Vec<BigUint>,
    },
    /// Cleartext delivered to every active session.
    Broadcast {
        sender: Identity,
        timestamp: String,
        text: String,
    },
}

impl Message {
    pub fn handshake(sender: Identity) -> Self {
        Message::Handshake {
            sender,
            timestamp: now_timestamp(),
            version: PROTOCOL_VERSION,
            accepted: false,
        }
    }

    pub fn handshake_reply(sender: Identity, accepted: bool) -> Self {
        Message::Handshake {
            sender,
            timestamp: now_timestamp(),
            version: PROTOCOL_VERSION,
            accepted,
        }
    }

    pub fn roster_update(identities: Vec<Identity>) -> Self {
        Message::RosterUpdate {
            sender: Identity::server(),
            timestamp: now_timestamp(),
            identities,
        }
    }

    pub fn direct(sender: Identity, recipient: String, cipher_blocks: Vec<BigUint>) -> Self {
        Message::Direct {
            sender,
            timestamp: now_timestamp(),
            recipient,
            cipher_blocks,
        }
    }

    pub fn broadcast(sender: Identity, text: String) -> Self {
        Message::Broadcast {
            sender,
            timestamp: now_timestamp(),
            text,
        }
    }

    pub fn sender(&self) -> &Identity {
        match self {
            Message::Handshake { sender, .. }
            | Message::RosterUpdate { sender, .. }
            | Message::Direct { sender, .. }
            | Message::Broadcast { sender, .. } => sender,
        }
    }

    pub fn timestamp(&self) -> &str {
        match self {
            Message::Handshake { timestamp, .. }
            | Message::RosterUpdate { timestamp, .. }
            | Message::Direct { timestamp, .. }
            | Message::Broadcast { timestamp, .. } => timestamp,
        }
    }

    /// The recipient name, for `Direct` messages only.
    pub fn direct_recipient(&self) -> Option<&str> {
        match self {
            Message::Direct { recipient, .. } => Some(recipient),
            _ => None,
        }
    }
}

pub fn now_timestamp() -> String {
    Local::now().format("%m/%d/%Y %I:%M:%S").to_string()
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // One encode, one write, one flush: the peer never observes a partial
    // message.
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
