//! Generates the material a server and one client need to talk: a
//! self-signed certificate and key, a client fingerprint and a shared
//! secret.

use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;
use rsc_core::config::ConfigFile;
use rsc_core::tls::fingerprint as cert_pin;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

pub const CERT_FILE: &str = "server.crt";
pub const KEY_FILE: &str = "server.key";
pub const CLIENTS_FILE: &str = "clients.json";
pub const CLIENT_CONFIG_FILE: &str = "client.json";

const FINGERPRINT_LEN: usize = 16;
const SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode {0}: {1}")]
    Encode(&'static str, serde_json::Error),
    #[error("refusing to overwrite {0}")]
    Exists(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Address clients will connect to; also decides the certificate names.
    pub addr: String,
    pub out_dir: PathBuf,
    pub overwrite: bool,
}

#[derive(Debug)]
pub struct Provisioned {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub clients: PathBuf,
    pub client_config: PathBuf,
    /// The client configuration, ready to hand to the shim's user.
    pub client_json: String,
}

#[derive(Serialize)]
struct ClientEntry<'a> {
    fingerprint: &'a str,
    secret: &'a str,
}

fn subject_names(addr: &str) -> Vec<String> {
    let host = addr
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(addr)
        .trim_start_matches('[')
        .trim_end_matches(']');
    let mut names = vec!["localhost".to_owned()];
    if !host.is_empty() && host != "localhost" {
        names.push(host.to_owned());
    }
    names
}

fn write(path: &Path, contents: &[u8], private: bool) -> Result<(), ProvisionError> {
    let err = |source| ProvisionError::Write {
        path: path.to_path_buf(),
        source,
    };
    fs::write(path, contents).map_err(err)?;
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(err)?;
    }
    #[cfg(not(unix))]
    let _ = private;
    Ok(())
}

pub fn provision(request: &ProvisionRequest) -> Result<Provisioned, ProvisionError> {
    let dir = &request.out_dir;
    fs::create_dir_all(dir).map_err(|source| ProvisionError::Write {
        path: dir.clone(),
        source,
    })?;
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);
    let clients_path = dir.join(CLIENTS_FILE);
    let client_path = dir.join(CLIENT_CONFIG_FILE);
    if !request.overwrite {
        for path in [&cert_path, &key_path, &clients_path, &client_path] {
            if path.exists() {
                return Err(ProvisionError::Exists(path.clone()));
            }
        }
    }

    let certified = rcgen::generate_simple_self_signed(subject_names(&request.addr))?;
    let pin = cert_pin(certified.cert.der());

    let mut id = [0u8; FINGERPRINT_LEN];
    OsRng.fill_bytes(&mut id);
    let fingerprint = hex::encode(id);
    let mut raw = Zeroizing::new([0u8; SECRET_LEN]);
    OsRng.fill_bytes(raw.as_mut());
    let secret = Zeroizing::new(STANDARD.encode(raw.as_ref()));

    let clients = serde_json::to_vec_pretty(&[ClientEntry {
        fingerprint: &fingerprint,
        secret: &secret,
    }])
    .map_err(|err| ProvisionError::Encode("client registry", err))?;
    let client = ConfigFile {
        addr: Some(request.addr.clone()),
        pin: Some(pin.clone()),
        fingerprint: Some(fingerprint.clone()),
        secret: Some(secret.to_string()),
        ..ConfigFile::default()
    };
    let client_json = serde_json::to_string_pretty(&client)
        .map_err(|err| ProvisionError::Encode("client configuration", err))?;

    write(&cert_path, certified.cert.pem().as_bytes(), false)?;
    write(
        &key_path,
        certified.key_pair.serialize_pem().as_bytes(),
        true,
    )?;
    write(&clients_path, &clients, true)?;
    write(&client_path, client_json.as_bytes(), true)?;
    info!(dir = %dir.display(), %fingerprint, %pin, "provisioned server and client material");

    Ok(Provisioned {
        cert: cert_path,
        key: key_path,
        clients: clients_path,
        client_config: client_path,
        client_json,
    })
}
