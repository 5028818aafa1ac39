mod client;
mod config;
mod connection;
mod error;
mod handshake;
mod login;
mod server;

pub use client::{Client, ClientHandler};
pub use config::Config;
pub use connection::{Carrier, Connection};
pub use error::{ConnectionError, DisconnectReason, LoginError, SeqMismatchInfo, ServerError};
pub use login::{LoginMsg, LoginOutcome, LoginRspMsg, MAX_NAME_SIZE};
pub use server::{NewConnectionDecision, Server, ServerHandler};
