//! Encrypted chat relay that runs over plain TCP.
//!
//! Clients register a name and an RSA public key with a central server;
//! directed messages are block-ciphered end to end with the recipient's key
//! and relayed opaquely, broadcasts go to everyone in the clear. See
//! `README.md` for usage and the wire protocol. Each module owns one
//! responsibility:
//!
//! - [`keys`] generates RSA key pairs and ciphers text in base-128 blocks.
//! - [`message`] defines the tagged message union and the JSON line
//!   protocol with its async read/write helpers.
//! - [`session`] wraps one TCP connection with atomic sends and blocking
//!   receives, split into reader and writer halves.
//! - [`registry`] is the server's roster: handshake validation, directed
//!   routing, broadcast fan-out, join/leave notices.
//! - [`server`] accepts connections and runs one reader task per client.
//! - [`client`] is the client coordinator: connect/handshake, peer roster,
//!   encrypt/decrypt, events for the display layer.
//! - [`console`] renders those events on a terminal and parses typed
//!   intents.
//! - [`cli`] parses the command-line interface for server and client modes.
//!
//! Integration and unit tests use this crate directly to exercise the
//! registry, the wire protocol, and the crypto round trip.

pub mod cli;
pub mod client;
pub mod console;
pub mod keys;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
