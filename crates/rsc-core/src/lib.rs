//! Shared building blocks for forwarding PKCS#11 calls to a remote token:
//! the wire codec, connection authentication, certificate pinning, client
//! configuration and the multiplexed client link.

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod tls;
pub mod types;

pub use client::RemoteClient;
pub use codec::{Frame, Opcode, Reply, Request, Response};
pub use config::ClientConfig;
pub use error::{RscError, RscResult};
pub use types::{
    Attribute, AttributeReport, AttributeRequest, AttributeValue, InfoText, LibraryInfo,
    Mechanism, MechanismInfo, OutputBuffer, SessionInfo, SlotInfo, TokenInfo, Version,
};
