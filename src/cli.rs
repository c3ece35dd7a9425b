use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay server and chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an
    /// ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name used when joining the chat.
    #[arg(long)]
    pub name: String,

    /// Address of the server to connect to, host:port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: String,

    /// First RSA prime. Given together with --q, overrides the prime pool.
    #[arg(long, requires = "q")]
    pub p: Option<u64>,

    /// Second RSA prime.
    #[arg(long, requires = "p")]
    pub q: Option<u64>,

    /// File of candidate primes, one per line, sampled when --p/--q are not
    /// given.
    #[arg(long, default_value = "resources/primes.txt")]
    pub prime_pool: PathBuf,
}
