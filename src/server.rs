//! Relay server: accept loop plus one reader task per connected client.
//!
//! Each connection must open with a handshake at the current protocol
//! version; anything else is a protocol violation and the connection is
//! dropped on the floor. After registration the task loops on the session,
//! handing directed messages and broadcasts to the registry until the
//! channel fails or closes, which is the normal way out.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{debug, info, warn};

use crate::message::{Message, PROTOCOL_VERSION};
use crate::registry::{Registry, RejectedSession, RouteOutcome};
use crate::session::{Session, SessionReader};

pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, registry } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    registry.shutdown_all().await;
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => spawn_client_handler(stream, peer, &registry),
                        Err(error) => warn!(?error, "failed to accept connection"),
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(?error, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_client_handler(stream: TcpStream, peer: SocketAddr, registry: &Arc<Registry>) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        if let Err(error) = handle_connection(stream, registry).await {
            warn!(%peer, ?error, "client connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, registry: Arc<Registry>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (mut reader, writer) = Session::new(stream).into_split();

    // The handshake comes first or not at all.
    let identity = match reader.receive_next().await? {
        Some(Message::Handshake { sender, version, .. }) if version == PROTOCOL_VERSION => sender,
        Some(Message::Handshake { version, .. }) => {
            warn!(?peer, version, "rejecting unsupported protocol version");
            return Ok(());
        }
        Some(_) => {
            warn!(?peer, "protocol violation: first message was not a handshake");
            return Ok(());
        }
        None => return Ok(()),
    };

    info!(?peer, name = %identity.name, "handshake received");

    match registry.validate_and_register(identity.clone(), writer).await {
        Ok(()) => {}
        Err(RejectedSession { reason, mut session }) => {
            info!(name = %identity.name, %reason, "registration refused");
            let refusal = Message::handshake_reply(identity, false);
            if let Err(error) = session.send(&refusal).await {
                debug!(?peer, ?error, "failed to deliver refusal");
            }
            session.close().await;
            return Ok(());
        }
    }

    run_session_loop(&registry, &mut reader, &identity.name).await;
    registry.deregister(&identity.name).await;

    Ok(())
}

async fn run_session_loop(registry: &Registry, reader: &mut SessionReader, name: &str) {
    loop {
        match reader.receive_next().await {
            Ok(Some(message @ Message::Direct { .. })) => {
                let recipient = message.direct_recipient().unwrap_or_default().to_string();
                match registry.route(message).await {
                    RouteOutcome::Delivered => {
                        info!(from = %name, to = %recipient, "forwarded direct message");
                    }
                    RouteOutcome::UnknownRecipient => {
                        warn!(from = %name, to = %recipient, "dropped direct message for unknown recipient");
                    }
                }
            }
            Ok(Some(message @ Message::Broadcast { .. })) => {
                info!(from = %name, "forwarding broadcast");
                registry.route_broadcast(message).await;
            }
            Ok(Some(_)) => {
                warn!(from = %name, "ignoring unexpected message after handshake");
            }
            Ok(None) => break,
            Err(error) => {
                // Read failure is the standard disconnect signal, explicit
                // or otherwise.
                debug!(from = %name, ?error, "session read failed");
                break;
            }
        }
    }
}
