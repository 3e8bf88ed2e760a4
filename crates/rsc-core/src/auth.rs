//! Connection authentication performed once per TLS connection.
//!
//! The client names itself by fingerprint and proves possession of the
//! shared secret with an HMAC-SHA256 over both parties' nonces and keying
//! material exported from the TLS session. Binding the proof to the exporter
//! ties it to this exact TLS connection, so a captured proof cannot be
//! replayed through another one. The secret itself never crosses the wire.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use zeroize::Zeroizing;

use crate::codec::{Frame, PROTOCOL_VERSION, read_frame, write_frame};
use crate::error::{RscError, RscResult};
use crate::types::b64;

pub const NONCE_LEN: usize = 32;
pub const EXPORTER_LEN: usize = 32;
pub const EXPORTER_LABEL: &[u8] = b"EXPORTER-remotesc-auth";
pub const MIN_SECRET_LEN: usize = 32;
const PROOF_DOMAIN: &[u8] = b"remotesc/auth/v1";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Handshake {
    Hello {
        version: u8,
        fingerprint: String,
        #[serde(with = "b64")]
        nonce: Vec<u8>,
    },
    Challenge {
        #[serde(with = "b64")]
        nonce: Vec<u8>,
    },
    Proof {
        #[serde(with = "b64")]
        mac: Vec<u8>,
    },
    Accepted,
    Rejected,
}

pub fn new_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Decodes a shared secret given as base64, falling back to its raw bytes.
pub fn parse_secret(secret: &str) -> RscResult<Zeroizing<Vec<u8>>> {
    let secret = secret.trim();
    let bytes = Zeroizing::new(
        STANDARD
            .decode(secret)
            .unwrap_or_else(|_| secret.as_bytes().to_vec()),
    );
    if bytes.len() < MIN_SECRET_LEN {
        return Err(RscError::config(format!(
            "shared secret must be at least {MIN_SECRET_LEN} bytes after decoding"
        )));
    }
    Ok(bytes)
}

fn proof_mac(
    secret: &[u8],
    fingerprint: &str,
    client_nonce: &[u8],
    server_nonce: &[u8],
    exporter: &[u8],
) -> RscResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(RscError::auth)?;
    mac.update(PROOF_DOMAIN);
    mac.update(&(fingerprint.len() as u32).to_be_bytes());
    mac.update(fingerprint.as_bytes());
    mac.update(client_nonce);
    mac.update(server_nonce);
    mac.update(exporter);
    Ok(mac)
}

pub fn compute_proof(
    secret: &[u8],
    fingerprint: &str,
    client_nonce: &[u8],
    server_nonce: &[u8],
    exporter: &[u8],
) -> RscResult<Vec<u8>> {
    let mac = proof_mac(secret, fingerprint, client_nonce, server_nonce, exporter)?;
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time check of a client's proof.
pub fn verify_proof(
    secret: &[u8],
    fingerprint: &str,
    client_nonce: &[u8],
    server_nonce: &[u8],
    exporter: &[u8],
    proof: &[u8],
) -> bool {
    proof_mac(secret, fingerprint, client_nonce, server_nonce, exporter)
        .is_ok_and(|mac| mac.verify_slice(proof).is_ok())
}

/// Runs the client side of the handshake over an established TLS stream.
pub async fn authenticate<S>(
    stream: &mut S,
    exporter: &[u8],
    fingerprint: &str,
    secret: &[u8],
    max_frame_len: usize,
) -> RscResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_nonce = new_nonce();
    let hello = Frame::Handshake(Handshake::Hello {
        version: PROTOCOL_VERSION,
        fingerprint: fingerprint.to_owned(),
        nonce: client_nonce.to_vec(),
    });
    write_frame(stream, &hello, max_frame_len).await?;

    let server_nonce = match read_frame(stream, max_frame_len).await? {
        Some(Frame::Handshake(Handshake::Challenge { nonce })) if nonce.len() == NONCE_LEN => {
            nonce
        }
        Some(Frame::Handshake(Handshake::Rejected)) => {
            return Err(RscError::auth("server refused the connection"));
        }
        Some(_) => return Err(RscError::auth("unexpected message during handshake")),
        None => return Err(RscError::ConnectionLost),
    };

    let mac = compute_proof(secret, fingerprint, &client_nonce, &server_nonce, exporter)?;
    write_frame(stream, &Frame::Handshake(Handshake::Proof { mac }), max_frame_len).await?;

    match read_frame(stream, max_frame_len).await? {
        Some(Frame::Handshake(Handshake::Accepted)) => {
            debug!("handshake accepted");
            Ok(())
        }
        Some(Frame::Handshake(Handshake::Rejected)) => {
            Err(RscError::auth("fingerprint or secret rejected"))
        }
        Some(_) => Err(RscError::auth("unexpected message during handshake")),
        None => Err(RscError::auth("server closed the connection during handshake")),
    }
}
