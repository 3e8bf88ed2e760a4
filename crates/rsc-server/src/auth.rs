use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use rsc_core::RscError;
use rsc_core::auth::{Handshake, NONCE_LEN, new_nonce, parse_secret, verify_proof};
use rsc_core::codec::{Frame, PROTOCOL_VERSION, read_frame, write_frame};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Checked against when a fingerprint is unknown so rejection costs the same
/// as a bad proof.
const DECOY_SECRET: [u8; 32] = [0x5a; 32];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClientEntry {
    fingerprint: String,
    secret: String,
}

/// Shared secrets of every client allowed to connect, keyed by fingerprint.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<String, Zeroizing<Vec<u8>>>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl ClientRegistry {
    pub fn single(fingerprint: &str, secret: &str) -> Result<Self> {
        let mut registry = Self::default();
        registry.insert(fingerprint, secret)?;
        Ok(registry)
    }

    /// Reads a JSON array of `{"fingerprint", "secret"}` entries.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read client registry {}", path.display()))?;
        let entries: Vec<ClientEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse client registry {}", path.display()))?;
        let mut registry = Self::default();
        for entry in entries {
            registry.insert(&entry.fingerprint, &entry.secret)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, fingerprint: &str, secret: &str) -> Result<()> {
        let fingerprint = fingerprint.trim();
        if fingerprint.is_empty() {
            bail!("client fingerprint must not be empty");
        }
        let secret = parse_secret(secret)
            .with_context(|| format!("invalid secret for client {fingerprint}"))?;
        if self.clients.insert(fingerprint.to_owned(), secret).is_some() {
            bail!("client {fingerprint} is registered twice");
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn secret(&self, fingerprint: &str) -> Option<&[u8]> {
        self.clients.get(fingerprint).map(|secret| secret.as_slice())
    }
}

/// Runs the server side of the handshake. Returns the authenticated
/// client's fingerprint; any failure leaves the connection to be dropped.
pub async fn accept_client<S>(
    stream: &mut S,
    registry: &ClientRegistry,
    exporter: &[u8],
    max_frame_len: usize,
) -> Result<String, RscError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (fingerprint, client_nonce) = match read_frame(stream, max_frame_len).await? {
        Some(Frame::Handshake(Handshake::Hello {
            version,
            fingerprint,
            nonce,
        })) => {
            if version != PROTOCOL_VERSION || nonce.len() != NONCE_LEN {
                reject(stream, max_frame_len).await;
                return Err(RscError::auth(format!(
                    "unsupported hello (version {version})"
                )));
            }
            (fingerprint, nonce)
        }
        Some(_) => return Err(RscError::auth("expected hello")),
        None => return Err(RscError::ConnectionLost),
    };

    let server_nonce = new_nonce();
    let challenge = Frame::Handshake(Handshake::Challenge {
        nonce: server_nonce.to_vec(),
    });
    write_frame(stream, &challenge, max_frame_len).await?;

    let proof = match read_frame(stream, max_frame_len).await? {
        Some(Frame::Handshake(Handshake::Proof { mac })) => mac,
        Some(_) => {
            reject(stream, max_frame_len).await;
            return Err(RscError::auth("expected proof"));
        }
        None => return Err(RscError::ConnectionLost),
    };

    let known = registry.secret(&fingerprint);
    let secret = known.unwrap_or(&DECOY_SECRET);
    let valid = verify_proof(
        secret,
        &fingerprint,
        &client_nonce,
        &server_nonce,
        exporter,
        &proof,
    );
    if !(valid && known.is_some()) {
        reject(stream, max_frame_len).await;
        warn!("client authentication failed");
        return Err(RscError::auth("client authentication failed"));
    }

    write_frame(stream, &Frame::Handshake(Handshake::Accepted), max_frame_len).await?;
    debug!(%fingerprint, "client authenticated");
    Ok(fingerprint)
}

async fn reject<S>(stream: &mut S, max_frame_len: usize)
where
    S: AsyncWrite + Unpin,
{
    let _ = write_frame(stream, &Frame::Handshake(Handshake::Rejected), max_frame_len).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use rsc_core::auth::authenticate;
    use rsc_core::codec::DEFAULT_MAX_FRAME_LEN;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";
    const EXPORTER: [u8; 32] = [3u8; 32];

    fn registry() -> ClientRegistry {
        ClientRegistry::single("client-a", &STANDARD.encode(SECRET)).expect("registry")
    }

    async fn run(fingerprint: &str, secret: &[u8]) -> (Result<(), RscError>, Result<String, RscError>) {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let registry = registry();
        let fingerprint = fingerprint.to_owned();
        let secret = secret.to_vec();
        let client_side = tokio::spawn(async move {
            authenticate(
                &mut client,
                &EXPORTER,
                &fingerprint,
                &secret,
                DEFAULT_MAX_FRAME_LEN,
            )
            .await
        });
        let server_result =
            accept_client(&mut server, &registry, &EXPORTER, DEFAULT_MAX_FRAME_LEN).await;
        drop(server);
        (client_side.await.expect("join"), server_result)
    }

    #[tokio::test]
    async fn registered_client_is_accepted() {
        let (client, server) = run("client-a", SECRET).await;
        client.expect("client accepted");
        assert_eq!(server.expect("server accepted"), "client-a");
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let (client, server) = run("client-a", b"ffffffffffffffffffffffffffffffff").await;
        assert!(matches!(client, Err(RscError::Auth(_))));
        assert!(matches!(server, Err(RscError::Auth(_))));
    }

    #[tokio::test]
    async fn unknown_fingerprint_is_rejected_even_with_decoy_secret() {
        let (client, server) = run("client-z", &DECOY_SECRET).await;
        assert!(matches!(client, Err(RscError::Auth(_))));
        assert!(matches!(server, Err(RscError::Auth(_))));
    }

    #[test]
    fn registry_file_rejects_duplicates_and_short_secrets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clients.json");
        let secret = STANDARD.encode(SECRET);

        fs::write(
            &path,
            format!(
                r#"[{{"fingerprint":"a","secret":"{secret}"}},{{"fingerprint":"b","secret":"{secret}"}}]"#
            ),
        )
        .expect("write");
        assert_eq!(ClientRegistry::from_file(&path).expect("load").len(), 2);

        fs::write(
            &path,
            format!(
                r#"[{{"fingerprint":"a","secret":"{secret}"}},{{"fingerprint":"a","secret":"{secret}"}}]"#
            ),
        )
        .expect("write");
        assert!(ClientRegistry::from_file(&path).is_err());

        fs::write(&path, r#"[{"fingerprint":"a","secret":"short"}]"#).expect("write");
        assert!(ClientRegistry::from_file(&path).is_err());
    }
}
