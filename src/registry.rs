//! Server-side roster of connected identities.
//!
//! The registry owns every active session's writer handle; registration,
//! deregistration, routing, and fan-out all run under one mutex, so fan-out
//! always sees a consistent snapshot and no write can race a removal. A
//! failed fan-out write is logged and left alone: that session's reader
//! task will observe the dead connection and deregister it.

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::message::{Identity, Message};
use crate::session::SessionWriter;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejected {
    #[error("name already in use")]
    NameInUse,
}

/// A refused registration, handing the session back so the caller can send
/// the refusal and close.
pub struct RejectedSession {
    pub reason: Rejected,
    pub session: SessionWriter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    UnknownRecipient,
}

struct RosterEntry {
    identity: Identity,
    session: SessionWriter,
}

#[derive(Default)]
pub struct Registry {
    // Insertion order is kept; roster updates list identities in join order.
    roster: Mutex<Vec<RosterEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a proposed identity and, if the name is free, activates the
    /// session: insert, acknowledge the handshake, announce the join, push a
    /// fresh roster to everyone.
    pub async fn validate_and_register(
        &self,
        identity: Identity,
        session: SessionWriter,
    ) -> Result<(), RejectedSession> {
        let mut roster = self.roster.lock().await;

        if roster.iter().any(|entry| entry.identity.name == identity.name) {
            return Err(RejectedSession {
                reason: Rejected::NameInUse,
                session,
            });
        }

        let name = identity.name.clone();
        roster.push(RosterEntry { identity: identity.clone(), session });

        let acknowledgement = Message::handshake_reply(identity, true);
        if let Some(entry) = roster.last_mut() {
            if let Err(error) = entry.session.send(&acknowledgement).await {
                debug!(%name, ?error, "failed to acknowledge handshake");
            }
        }

        info!(%name, "client registered");
        let notice = Message::broadcast(Identity::server(), format!("{name} joined the chat"));
        fan_out(&mut roster, &notice).await;
        let update = Message::roster_update(identities_of(&roster));
        fan_out(&mut roster, &update).await;

        Ok(())
    }

    /// Forwards a `Direct` message to its recipient, cipher blocks
    /// untouched. An unknown recipient is reported to the caller for
    /// logging and the message is dropped; the sender is never told.
    pub async fn route(&self, direct: Message) -> RouteOutcome {
        let recipient = match direct.direct_recipient() {
            Some(name) => name.to_string(),
            None => {
                warn!("route called with a non-direct message");
                return RouteOutcome::UnknownRecipient;
            }
        };

        let mut roster = self.roster.lock().await;
        match roster
            .iter_mut()
            .find(|entry| entry.identity.name == recipient)
        {
            Some(entry) => {
                if let Err(error) = entry.session.send(&direct).await {
                    debug!(%recipient, ?error, "failed to deliver direct message");
                }
                RouteOutcome::Delivered
            }
            None => RouteOutcome::UnknownRecipient,
        }
    }

    /// Forwards a message to every active session, the sender's included;
    /// suppressing the sender's own copy is a display concern.
    pub async fn route_broadcast(&self, message: Message) {
        let mut roster = self.roster.lock().await;
        fan_out(&mut roster, &message).await;
    }

    /// Removes `name` from the roster, closes its session, and tells the
    /// remaining clients. A name that is already gone is a no-op: the
    /// disconnect path and a failed write can both lead here.
    pub async fn deregister(&self, name: &str) {
        let mut roster = self.roster.lock().await;
        let Some(index) = roster.iter().position(|entry| entry.identity.name == name) else {
            return;
        };

        let mut entry = roster.remove(index);
        entry.session.close().await;
        info!(%name, "client deregistered");

        let notice = Message::broadcast(Identity::server(), format!("{name} left the chat"));
        fan_out(&mut roster, &notice).await;
        let update = Message::roster_update(identities_of(&roster));
        fan_out(&mut roster, &update).await;
    }

    /// Announces shutdown, closes every session, clears the roster.
    pub async fn shutdown_all(&self) {
        let mut roster = self.roster.lock().await;
        let notice = Message::broadcast(Identity::server(), "server shutting down".into());
        fan_out(&mut roster, &notice).await;
        for entry in roster.iter_mut() {
            entry.session.close().await;
        }
        roster.clear();
    }

    /// Active identity names in join order.
    pub async fn active_names(&self) -> Vec<String> {
        let roster = self.roster.lock().await;
        roster
            .iter()
            .map(|entry| entry.identity.name.clone())
            .collect()
    }
}

fn identities_of(roster: &[RosterEntry]) -> Vec<Identity> {
    roster.iter().map(|entry| entry.identity.clone()).collect()
}

async fn fan_out(roster: &mut [RosterEntry], message: &Message) {
    for entry in roster.iter_mut() {
        if let Err(error) = entry.session.send(message).await {
            debug!(name = %entry.identity.name, ?error, "failed to deliver during fan-out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionReader, SessionWriter};
    use tokio::net::{TcpListener, TcpStream};

    // A loopback connection: the writer goes to the registry, the reader
    // plays the client's end of the wire.
    async fn session_ends() -> (SessionReader, SessionWriter) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.expect("connect");
        let (server, _) = accepted.expect("accept");
        // Dropping the client's writer only shuts the client-to-server
        // direction; the registry's writes still get through.
        let (client_reader, _client_writer) = Session::new(client).into_split();
        let (_server_reader, server_writer) = Session::new(server).into_split();
        (client_reader, server_writer)
    }

    async fn register(registry: &Registry, name: &str) -> SessionReader {
        let (reader, writer) = session_ends().await;
        registry
            .validate_and_register(Identity::new(name, None), writer)
            .await
            .unwrap_or_else(|_| panic!("{name} should register"));
        reader
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected_and_roster_unchanged() {
        let registry = Registry::new();
        let _alice = register(&registry, "alice").await;

        let (_reader, writer) = session_ends().await;
        let rejected = registry
            .validate_and_register(Identity::new("alice", None), writer)
            .await;
        match rejected {
            Err(RejectedSession { reason, .. }) => assert_eq!(reason, Rejected::NameInUse),
            Ok(()) => panic!("second alice must be rejected"),
        }
        assert_eq!(registry.active_names().await, vec!["alice"]);
    }

    #[tokio::test]
    async fn roster_keeps_join_order() {
        let registry = Registry::new();
        let _c = register(&registry, "carol").await;
        let _a = register(&registry, "alice").await;
        let _b = register(&registry, "bob").await;
        assert_eq!(registry.active_names().await, vec!["carol", "alice", "bob"]);

        registry.deregister("alice").await;
        assert_eq!(registry.active_names().await, vec!["carol", "bob"]);
    }

    #[tokio::test]
    async fn registration_acknowledges_then_announces() {
        let registry = Registry::new();
        let mut alice = register(&registry, "alice").await;

        match alice.receive_next().await.expect("read") {
            Some(Message::Handshake { accepted, sender, .. }) => {
                assert!(accepted);
                assert_eq!(sender.name, "alice");
            }
            other => panic!("expected handshake acknowledgement, got {other:?}"),
        }
        match alice.receive_next().await.expect("read") {
            Some(Message::Broadcast { text, sender, .. }) => {
                assert_eq!(text, "alice joined the chat");
                assert_eq!(sender.name, crate::message::SERVER_NAME);
            }
            other => panic!("expected join notice, got {other:?}"),
        }
        match alice.receive_next().await.expect("read") {
            Some(Message::RosterUpdate { identities, .. }) => {
                let names: Vec<_> = identities.into_iter().map(|id| id.name).collect();
                assert_eq!(names, vec!["alice"]);
            }
            other => panic!("expected roster update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_recipients_are_reported_not_delivered() {
        let registry = Registry::new();
        let _alice = register(&registry, "alice").await;

        let direct = Message::direct(Identity::new("alice", None), "carol".into(), vec![]);
        assert_eq!(registry.route(direct).await, RouteOutcome::UnknownRecipient);
    }

    #[tokio::test]
    async fn directs_reach_only_their_recipient() {
        let registry = Registry::new();
        let mut alice = register(&registry, "alice").await;
        let mut bob = register(&registry, "bob").await;

        // Drain the registration traffic: alice sees her own join sequence
        // plus bob's, bob sees only his own.
        for _ in 0..5 {
            alice.receive_next().await.expect("read");
        }
        for _ in 0..3 {
            bob.receive_next().await.expect("read");
        }

        let direct = Message::direct(Identity::new("alice", None), "bob".into(), vec![]);
        assert_eq!(
            registry.route(direct.clone()).await,
            RouteOutcome::Delivered
        );

        let received = bob
            .receive_next()
            .await
            .expect("read")
            .expect("bob should receive the direct message");
        assert_eq!(received, direct);

        // Nothing for alice.
        let quiet = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            alice.receive_next(),
        )
        .await;
        assert!(quiet.is_err(), "alice must not see the direct message");
    }

    #[tokio::test]
    async fn shutdown_clears_the_roster_and_closes_sessions() {
        let registry = Registry::new();
        let mut alice = register(&registry, "alice").await;
        for _ in 0..3 {
            alice.receive_next().await.expect("read");
        }

        registry.shutdown_all().await;
        assert!(registry.active_names().await.is_empty());

        match alice.receive_next().await.expect("read") {
            Some(Message::Broadcast { text, .. }) => {
                assert_eq!(text, "server shutting down");
            }
            other => panic!("expected shutdown notice, got {other:?}"),
        }
        let next = alice.receive_next().await.expect("clean close");
        assert!(next.is_none());
    }
}
