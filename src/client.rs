//! Client-side coordinator: owns the connection to the relay, drives the
//! handshake, keeps the peer roster with public keys, and turns inbound
//! traffic into events for whatever front-end is attached.
//!
//! The coordinator is handed an event channel at connect time; everything
//! the display layer needs arrives there. Directed text is encrypted here
//! with the recipient's roster key and decrypted here with the local
//! private key; the relay only ever sees cipher blocks.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::keys::{self, KeyError, KeyPair};
use crate::message::{Identity, Message, PROTOCOL_VERSION};
use crate::session::{Session, SessionReader, SessionWriter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the primes for this session's key pair come from: explicit user
/// input, or uniform sampling over a candidate pool.
#[derive(Debug, Clone)]
pub enum KeySource {
    Manual { p: u64, q: u64 },
    Pool { candidates: Vec<u64> },
}

/// Notifications for the display collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected { name: String },
    Disconnected { reason: String },
    Status { text: String },
    RosterChanged { names: Vec<String> },
    DirectReceived { from: String, timestamp: String, text: String },
    BroadcastReceived { from: String, timestamp: String, text: String },
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("name already in use")]
    NameInUse,
    #[error("malformed handshake reply")]
    MalformedReply,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("cannot resolve server address {0}")]
    InvalidHost(String),
    #[error("timed out connecting to {0}")]
    Timeout(String),
    #[error("failed to connect to {addr}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("connection lost during handshake")]
    ConnectionLost,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no connected user named {0}")]
    UnknownRecipient(String),
    #[error("{0} has not shared a public key")]
    NoPublicKey(String),
    #[error("failed to send")]
    Io(#[from] io::Error),
}

pub struct Coordinator {
    identity: Identity,
    writer: SessionWriter,
    roster: Arc<Mutex<Vec<Identity>>>,
    stop: oneshot::Sender<()>,
    reader_task: JoinHandle<()>,
}

impl Coordinator {
    /// Generates a key pair, connects within a bounded timeout, and runs the
    /// handshake. Any failure lands the caller back where it started: no
    /// half-open coordinator escapes this function.
    pub async fn connect(
        host: &str,
        port: u16,
        name: &str,
        key_source: KeySource,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<Self, ConnectError> {
        let keys = match key_source {
            KeySource::Manual { p, q } => KeyPair::generate(p, q)?,
            KeySource::Pool { candidates } => KeyPair::auto_generate(&candidates)?,
        };
        let identity = Identity::new(name, Some(keys.public_key()));

        let addr = lookup_host((host, port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConnectError::InvalidHost(host.to_string()))?;

        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ConnectError::ConnectFailed {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => return Err(ConnectError::Timeout(addr.to_string())),
        };
        info!(%addr, name, "connected, sending handshake");

        let (mut reader, mut writer) = Session::new(stream).into_split();
        writer
            .send(&Message::handshake(identity.clone()))
            .await
            .map_err(|_| ConnectError::ConnectionLost)?;

        // The first reply must be a handshake with our protocol version.
        match reader.receive_next().await {
            Ok(Some(Message::Handshake { accepted, version, .. })) => {
                if version != PROTOCOL_VERSION {
                    return Err(HandshakeError::MalformedReply.into());
                }
                if !accepted {
                    return Err(HandshakeError::NameInUse.into());
                }
            }
            Ok(Some(_)) => return Err(HandshakeError::MalformedReply.into()),
            Ok(None) | Err(_) => return Err(ConnectError::ConnectionLost),
        }

        let _ = events.send(ClientEvent::Connected {
            name: name.to_string(),
        });

        let roster = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, stop_rx) = oneshot::channel();
        // The key pair moves into the reader task: inbound directs are the
        // only thing the private half is ever used for.
        let reader_task = tokio::spawn(read_loop(
            reader,
            keys,
            Arc::clone(&roster),
            events,
            stop_rx,
        ));

        Ok(Self {
            identity,
            writer,
            roster,
            stop: stop_tx,
            reader_task,
        })
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Encrypts `text` under the recipient's roster key and sends it.
    /// A recipient missing from the latest roster is a local precondition
    /// failure; nothing goes on the wire.
    pub async fn send_direct(&mut self, recipient: &str, text: &str) -> Result<(), SendError> {
        let public_key = {
            let roster = self.roster.lock().await;
            let peer = roster
                .iter()
                .find(|identity| identity.name == recipient)
                .ok_or_else(|| SendError::UnknownRecipient(recipient.to_string()))?;
            peer.public_key
                .clone()
                .ok_or_else(|| SendError::NoPublicKey(recipient.to_string()))?
        };

        let cipher_blocks = keys::encrypt_text(text, &public_key);
        let message = Message::direct(self.identity.clone(), recipient.to_string(), cipher_blocks);
        self.writer.send(&message).await?;
        Ok(())
    }

    /// Sends cleartext to every connected identity via the relay. The
    /// sender identity carries no key; broadcasts need none.
    pub async fn send_broadcast(&mut self, text: &str) -> Result<(), SendError> {
        let sender = Identity::new(self.identity.name.clone(), None);
        let message = Message::broadcast(sender, text.to_string());
        self.writer.send(&message).await?;
        Ok(())
    }

    /// Current roster names, own name included.
    pub async fn roster_names(&self) -> Vec<String> {
        let roster = self.roster.lock().await;
        roster.iter().map(|identity| identity.name.clone()).collect()
    }

    /// Signals the reader task and closes the channel. The server observes
    /// the close as a failed read and deregisters; there is no goodbye
    /// message in the protocol.
    pub async fn disconnect(self) {
        let Coordinator {
            mut writer,
            stop,
            reader_task,
            ..
        } = self;
        let _ = stop.send(());
        writer.close().await;
        if let Err(error) = reader_task.await {
            debug!(?error, "reader task did not exit cleanly");
        }
    }
}

async fn read_loop(
    mut reader: SessionReader,
    keys: KeyPair,
    roster: Arc<Mutex<Vec<Identity>>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let reason = loop {
        select! {
            _ = &mut stop => break "disconnected".to_string(),
            incoming = reader.receive_next() => match incoming {
                Ok(Some(message)) => handle_message(message, &keys, &roster, &events).await,
                Ok(None) => break "server closed the connection".to_string(),
                Err(error) => break format!("lost connection to server: {error}"),
            }
        }
    };
    let _ = events.send(ClientEvent::Disconnected { reason });
}

async fn handle_message(
    message: Message,
    keys: &KeyPair,
    roster: &Mutex<Vec<Identity>>,
    events: &mpsc::UnboundedSender<ClientEvent>,
) {
    match message {
        Message::RosterUpdate { identities, .. } => {
            // Full replacement, not a merge; the server's list is the truth.
            let names: Vec<String> = identities.iter().map(|id| id.name.clone()).collect();
            *roster.lock().await = identities;
            let _ = events.send(ClientEvent::RosterChanged { names });
        }
        Message::Direct { sender, timestamp, cipher_blocks, .. } => {
            let text = keys::decrypt_text(&cipher_blocks, keys);
            let _ = events.send(ClientEvent::Status {
                text: format!("direct message from {} ({timestamp})", sender.name),
            });
            let _ = events.send(ClientEvent::DirectReceived {
                from: sender.name,
                timestamp,
                text,
            });
        }
        Message::Broadcast { sender, timestamp, text } => {
            let _ = events.send(ClientEvent::BroadcastReceived {
                from: sender.name,
                timestamp,
                text,
            });
        }
        Message::Handshake { sender, .. } => {
            warn!(name = %sender.name, "ignoring unexpected handshake after registration");
        }
    }
}
