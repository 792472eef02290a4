//! WireGuard key material, server record and config rendering.
//!
//! The gateway never talks to the kernel interface directly: it regenerates
//! the interface file on every client mutation and reads transfer counters
//! through `wg show`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use ipnet::IpNet;
use rand::RngCore;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use tera::Context as TeraContext;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::WireGuardConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::services::{command, ipam, templates};
use crate::store::{self, StoreLock};
use crate::types::{Client, ServerInfo};

pub const KEY_LENGTH: usize = 32;

/// A Curve25519 key pair, base64 encoded the way `wg` prints keys.
#[derive(Clone)]
pub struct KeyPair {
    private_key: [u8; KEY_LENGTH],
    public_key: [u8; KEY_LENGTH],
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private_key: secret.to_bytes(),
            public_key: public.to_bytes(),
        }
    }

    pub fn private_key_base64(&self) -> String {
        BASE64_STANDARD.encode(self.private_key)
    }

    pub fn public_key_base64(&self) -> String {
        BASE64_STANDARD.encode(self.public_key)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_base64())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

pub fn generate_preshared_key() -> String {
    let mut key = [0u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut key);
    BASE64_STANDARD.encode(key)
}

/// Check that `key` is base64 for exactly 32 bytes.
pub fn validate_key(key: &str) -> std::result::Result<(), String> {
    let bytes = BASE64_STANDARD
        .decode(key.trim())
        .map_err(|e| format!("invalid base64 key: {}", e))?;
    if bytes.len() != KEY_LENGTH {
        return Err(format!(
            "invalid key length: expected {}, got {}",
            KEY_LENGTH,
            bytes.len()
        ));
    }
    Ok(())
}

// ============================================================================
// Server record
// ============================================================================

/// The node's own interface, persisted as `server.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub address: Vec<String>,
    pub listen_port: u16,
    pub private_key: String,
    pub public_key: String,
    pub endpoint: String,
    pub persistent_keepalive: u16,
    pub dns: Vec<String>,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub post_up: String,
    #[serde(default)]
    pub post_down: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ServerRecord {
    /// Load `server.json`, creating it with a fresh key pair on first start.
    /// Keys are durable; every other setting follows the current configuration.
    pub fn load_or_init(cfg: &WireGuardConfig) -> Result<Self> {
        for addr in &cfg.address {
            ipam::parse_cidr(addr)
                .with_context(|| format!("Invalid WireGuard server address: {}", addr))?;
        }

        let _lock = StoreLock::for_file(&cfg.server_file)?;
        let existing: Option<ServerRecord> = store::read_json(&cfg.server_file)?;
        let now = now_millis();

        let (private_key, public_key, created_at) = match existing {
            Some(ref s) => (s.private_key.clone(), s.public_key.clone(), s.created_at),
            None => {
                let keys = KeyPair::generate();
                tracing::info!("Generated WireGuard server key pair");
                (keys.private_key_base64(), keys.public_key_base64(), now)
            }
        };

        let server = ServerRecord {
            address: cfg.address.clone(),
            listen_port: cfg.listen_port,
            private_key,
            public_key,
            endpoint: format!("{}:{}", cfg.endpoint_host, cfg.listen_port),
            persistent_keepalive: cfg.keepalive,
            dns: cfg.dns.clone(),
            allowed_ips: cfg.allowed_ips.clone(),
            post_up: cfg.post_up.clone().unwrap_or_default(),
            post_down: cfg.post_down.clone().unwrap_or_default(),
            created_at,
            updated_at: now,
        };

        store::write_json(&cfg.server_file, &server)?;
        restrict_permissions(&cfg.server_file)?;
        Ok(server)
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            public_key: self.public_key.clone(),
            endpoint: self.endpoint.clone(),
            listen_port: self.listen_port,
            address: self.address.clone(),
            dns: self.dns.clone(),
            allowed_ips: self.allowed_ips.clone(),
            persistent_keepalive: self.persistent_keepalive,
        }
    }

    /// The server's own interface addresses, never handed to a client.
    pub fn reserved_ips(&self) -> Vec<IpAddr> {
        self.address
            .iter()
            .filter_map(|a| ipam::parse_cidr(a))
            .map(|net: IpNet| net.addr())
            .collect()
    }
}

pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

// ============================================================================
// Rendering
// ============================================================================

// Values land on `Key = value` lines; a newline would start a new directive.
fn clean<'a>(field: &str, value: &'a str) -> GatewayResult<&'a str> {
    if value.chars().any(|c| c.is_control()) {
        return Err(GatewayError::Render(format!(
            "{} contains control characters",
            field
        )));
    }
    Ok(value)
}

fn clean_list<'a>(field: &str, values: &'a [String]) -> GatewayResult<&'a [String]> {
    for v in values {
        clean(field, v)?;
    }
    Ok(values)
}

#[derive(Serialize)]
struct PeerSection<'a> {
    name: &'a str,
    email: &'a str,
    updated_at: i64,
    public_key: &'a str,
    preshared_key: &'a str,
    address: &'a [String],
}

/// Render the server interface file: one `[Peer]` per enabled client, in the
/// order given.
pub fn render_server_config(server: &ServerRecord, clients: &[Client]) -> GatewayResult<String> {
    let peers = clients
        .iter()
        .filter(|c| c.enable)
        .map(|client| {
            Ok(PeerSection {
                name: clean("client name", &client.name)?,
                email: clean("client email", &client.email)?,
                updated_at: client.updated_at,
                public_key: clean("public key", &client.public_key)?,
                preshared_key: clean("preshared key", &client.preshared_key)?,
                address: clean_list("client address", &client.address)?,
            })
        })
        .collect::<GatewayResult<Vec<_>>>()?;

    let mut context = TeraContext::new();
    context.insert("address", clean_list("server address", &server.address)?);
    context.insert("listen_port", &server.listen_port);
    context.insert("private_key", clean("server private key", &server.private_key)?);
    context.insert("post_up", clean("post up", &server.post_up)?);
    context.insert("post_down", clean("post down", &server.post_down)?);
    context.insert("peers", &peers);
    templates::render(templates::WG_SERVER, &context)
}

/// Render the config a client imports into its WireGuard app.
pub fn render_client_config(client: &Client, server: &ServerRecord) -> GatewayResult<String> {
    let allowed_ips = if client.allowed_ips.is_empty() {
        &server.allowed_ips
    } else {
        &client.allowed_ips
    };
    let keepalive = (!client.ignore_persistent_keepalive && server.persistent_keepalive > 0)
        .then_some(server.persistent_keepalive);

    let mut context = TeraContext::new();
    context.insert("address", clean_list("client address", &client.address)?);
    context.insert("private_key", clean("private key", &client.private_key)?);
    context.insert("dns", clean_list("dns", &server.dns)?);
    context.insert("server_public_key", clean("server public key", &server.public_key)?);
    context.insert("preshared_key", clean("preshared key", &client.preshared_key)?);
    context.insert("allowed_ips", clean_list("allowed ips", allowed_ips)?);
    context.insert("endpoint", clean("endpoint", &server.endpoint)?);
    context.insert("keepalive", &keepalive);
    templates::render(templates::WG_CLIENT, &context)
}

/// Replace the interface file; it holds the server private key.
pub fn write_server_config(path: &Path, contents: &str) -> Result<()> {
    store::write_atomic(path, contents.as_bytes())?;
    restrict_permissions(path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to restrict permissions on {:?}", path))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

// ============================================================================
// Peer statistics
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerTransfer {
    pub received_bytes: u64,
    pub transmitted_bytes: u64,
}

/// Source of live per-peer byte counters keyed by public key.
#[async_trait]
pub trait PeerStats: Send + Sync {
    async fn transfer(&self) -> Result<HashMap<String, PeerTransfer>>;
}

/// Reads counters with `wg show all transfer`.
pub struct WgCliStats;

#[async_trait]
impl PeerStats for WgCliStats {
    async fn transfer(&self) -> Result<HashMap<String, PeerTransfer>> {
        let output = command::run("wg", &command::args(["show", "all", "transfer"]))
            .await
            .context("Failed to query WireGuard transfer stats")?;
        Ok(parse_transfer(&output))
    }
}

/// Parse `<interface> <public key> <rx> <tx>` lines.
pub fn parse_transfer(output: &str) -> HashMap<String, PeerTransfer> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            Some((
                fields[1].to_string(),
                PeerTransfer {
                    received_bytes: fields[2].parse().unwrap_or(0),
                    transmitted_bytes: fields[3].parse().unwrap_or(0),
                },
            ))
        })
        .collect()
}
