use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::services::ipam;
use crate::services::wireguard::{self, KeyPair, PeerStats, ServerRecord};
use crate::store::{self, execute_async, StoreLock};
use crate::types::Client;

/// Client config rendered for download, or as a QR code.
pub enum ClientConfig {
    Text(String),
    QrSvg(String),
}

/// Durable `uuid -> Client` mapping, one JSON file per client.
///
/// Every mutation regenerates the WireGuard interface file while still holding
/// the directory lock, so the file always reflects a committed set of clients.
#[derive(Clone)]
pub struct ClientRegistry {
    clients_dir: PathBuf,
    interface_file: PathBuf,
    server: Arc<ServerRecord>,
    stats: Arc<dyn PeerStats>,
}

impl ClientRegistry {
    pub fn new(
        clients_dir: PathBuf,
        interface_file: PathBuf,
        server: Arc<ServerRecord>,
        stats: Arc<dyn PeerStats>,
    ) -> Self {
        Self {
            clients_dir,
            interface_file,
            server,
            stats,
        }
    }

    pub fn server(&self) -> &ServerRecord {
        &self.server
    }

    /// Write the interface file from whatever is on disk. Used at start-up.
    pub async fn sync_interface(&self) -> GatewayResult<()> {
        let this = self.clone();
        execute_async(move || {
            let _lock = StoreLock::for_dir(&this.clients_dir).map_err(GatewayError::persistence)?;
            this.write_interface()
        })
        .await
    }

    /// Validate `spec`, allocate one address per requested network and persist
    /// the new client.
    pub async fn register(&self, spec: Client) -> GatewayResult<Client> {
        let errors = validate(&spec);
        if !errors.is_empty() {
            return Err(GatewayError::Validation(errors));
        }

        let this = self.clone();
        let client = execute_async(move || {
            let _lock = StoreLock::for_dir(&this.clients_dir).map_err(GatewayError::persistence)?;

            let existing = load_all(&this.clients_dir)?;
            let mut reserved = this.reserved_ips(&existing, None);

            let networks: Vec<IpNet> = spec
                .address
                .iter()
                .filter_map(|a| ipam::parse_cidr(a))
                .map(|net| net.trunc())
                .collect();
            let address = ipam::allocate_batch(&networks, &mut reserved)?;

            let mut client = spec;
            client.uuid = Uuid::new_v4().to_string();
            client.address = address;
            client.preshared_key = wireguard::generate_preshared_key();
            if client.public_key.trim().is_empty() {
                let keys = KeyPair::generate();
                client.public_key = keys.public_key_base64();
                client.private_key = keys.private_key_base64();
            } else {
                client.public_key = client.public_key.trim().to_string();
                client.private_key = String::new();
            }
            client.created_at = wireguard::now_millis();
            client.updated_at = client.created_at;

            let path = this.client_path(&client.uuid)?;
            write_client(&path, &client)?;
            let stored = read_client(&path)?
                .ok_or_else(|| GatewayError::Persistence(format!("client {} vanished", client.uuid)))?;

            info!(client_id = %stored.uuid, address = ?stored.address, "Registered client");

            // The record is committed; a failed regeneration is reported, not rolled back.
            this.write_interface()?;
            Ok(stored)
        })
        .await?;

        Ok(client)
    }

    pub async fn read(&self, id: &str) -> GatewayResult<Client> {
        let path = self.client_path(id)?;
        let id = id.to_string();
        let mut client = execute_async(move || {
            read_client(&path)?.ok_or_else(|| GatewayError::NotFound(format!("client {}", id)))
        })
        .await?;

        self.merge_stats(std::slice::from_mut(&mut client)).await;
        Ok(client)
    }

    /// Replace the mutable fields of a client. Keys and creation metadata are
    /// always kept from the stored record.
    pub async fn update(&self, id: &str, spec: Client) -> GatewayResult<Client> {
        let this = self.clone();
        let id = id.to_string();

        execute_async(move || {
            let _lock = StoreLock::for_dir(&this.clients_dir).map_err(GatewayError::persistence)?;

            let path = this.client_path(&id)?;
            let current = read_client(&path)?
                .ok_or_else(|| GatewayError::NotFound(format!("client {}", id)))?;

            let mut errors = validate(&spec);
            if errors.is_empty() {
                let existing = load_all(&this.clients_dir)?;
                let taken = this.reserved_ips(&existing, Some(&current.uuid));
                for addr in &spec.address {
                    if let Some(net) = ipam::parse_cidr(addr) {
                        if taken.contains(&net.addr()) {
                            errors.push(format!("address {} is already in use", addr));
                        }
                    }
                }
            }
            if !errors.is_empty() {
                return Err(GatewayError::Validation(errors));
            }

            if spec.uuid != current.uuid {
                return Err(GatewayError::Mismatch(format!(
                    "record {} cannot be updated with {:?}",
                    current.uuid, spec.uuid
                )));
            }

            let mut client = spec;
            client.public_key = current.public_key;
            client.preshared_key = current.preshared_key;
            client.private_key = current.private_key;
            client.created_at = current.created_at;
            client.created_by = current.created_by;
            client.updated_at = wireguard::now_millis();

            write_client(&path, &client)?;
            let stored = read_client(&path)?
                .ok_or_else(|| GatewayError::Persistence(format!("client {} vanished", id)))?;

            info!(client_id = %stored.uuid, "Updated client");
            this.write_interface()?;
            Ok(stored)
        })
        .await
    }

    pub async fn delete(&self, id: &str) -> GatewayResult<()> {
        let this = self.clone();
        let id = id.to_string();

        execute_async(move || {
            let _lock = StoreLock::for_dir(&this.clients_dir).map_err(GatewayError::persistence)?;

            let removed = store::remove_if_exists(&this.client_path(&id)?)
                .map_err(GatewayError::persistence)?;
            if !removed {
                return Err(GatewayError::NotFound(format!("client {}", id)));
            }

            info!(client_id = %id, "Deleted client");
            this.write_interface()
        })
        .await
    }

    /// All clients ordered by creation time, with live transfer counters.
    pub async fn list(&self) -> GatewayResult<Vec<Client>> {
        let dir = self.clients_dir.clone();
        let mut clients = execute_async(move || load_all(&dir)).await?;
        self.merge_stats(&mut clients).await;
        Ok(clients)
    }

    /// Ids of every stored client; peer counters are not queried.
    pub async fn ids(&self) -> GatewayResult<Vec<String>> {
        let dir = self.clients_dir.clone();
        let clients = execute_async(move || load_all(&dir)).await?;
        Ok(clients.into_iter().map(|c| c.uuid).collect())
    }

    pub async fn read_config(&self, id: &str, qrcode: bool) -> GatewayResult<ClientConfig> {
        let client = self.read(id).await?;
        let text = wireguard::render_client_config(&client, &self.server)?;

        if !qrcode {
            return Ok(ClientConfig::Text(text));
        }

        let code = qrcode::QrCode::new(text.as_bytes())
            .map_err(|e| GatewayError::Render(format!("QR encoding failed: {}", e)))?;
        let svg = code
            .render::<qrcode::render::svg::Color>()
            .min_dimensions(256, 256)
            .build();
        Ok(ClientConfig::QrSvg(svg))
    }

    // Stats are best effort: a failed query leaves the stored counters.
    async fn merge_stats(&self, clients: &mut [Client]) {
        let stats = match self.stats.transfer().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Peer stats unavailable: {:#}", e);
                return;
            }
        };

        for client in clients.iter_mut() {
            if let Some(transfer) = stats.get(&client.public_key) {
                client.receive_bytes = transfer.received_bytes;
                client.transmit_bytes = transfer.transmitted_bytes;
            }
        }
    }

    // Ids are UUIDs; anything else cannot name a record.
    fn client_path(&self, id: &str) -> GatewayResult<PathBuf> {
        Uuid::parse_str(id).map_err(|_| GatewayError::NotFound(format!("client {}", id)))?;
        Ok(self.clients_dir.join(id))
    }

    fn reserved_ips(&self, clients: &[Client], skip: Option<&str>) -> HashSet<IpAddr> {
        let mut reserved: HashSet<IpAddr> = self.server.reserved_ips().into_iter().collect();
        for client in clients {
            if Some(client.uuid.as_str()) == skip {
                continue;
            }
            reserved.extend(
                client
                    .address
                    .iter()
                    .filter_map(|a| ipam::parse_cidr(a))
                    .map(|net| net.addr()),
            );
        }
        reserved
    }

    fn write_interface(&self) -> GatewayResult<()> {
        let clients = load_all(&self.clients_dir)?;
        let text = wireguard::render_server_config(&self.server, &clients)?;
        wireguard::write_server_config(&self.interface_file, &text)
            .map_err(|e| GatewayError::Render(format!("{:#}", e)))
    }
}

/// Collect every violation in `spec`.
pub fn validate(spec: &Client) -> Vec<String> {
    let mut errors = Vec::new();

    let name_len = spec.name.trim().chars().count();
    if name_len == 0 {
        errors.push("name field is required".to_string());
    } else if !(2..=40).contains(&name_len) {
        errors.push("name field must be between 2-40 chars".to_string());
    }

    if !spec.email.is_empty() && !is_email(&spec.email) {
        errors.push("email is invalid".to_string());
    }

    if spec.address.is_empty() {
        errors.push("address field is required".to_string());
    }
    for addr in &spec.address {
        if !is_cidr(addr) {
            errors.push(format!("address {} is invalid", addr));
        }
    }

    for allowed in &spec.allowed_ips {
        if !is_cidr(allowed) {
            errors.push(format!("allowedIPs {} is invalid", allowed));
        }
    }

    if !spec.public_key.trim().is_empty() {
        if let Err(reason) = wireguard::validate_key(&spec.public_key) {
            errors.push(format!("publicKey is invalid: {}", reason));
        }
    }

    errors
}

fn is_cidr(value: &str) -> bool {
    value.trim().parse::<IpNet>().is_ok()
}

fn is_email(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

fn read_client(path: &Path) -> GatewayResult<Option<Client>> {
    store::read_json(path).map_err(GatewayError::persistence)
}

// Counters are live values; never persist them.
fn write_client(path: &Path, client: &Client) -> GatewayResult<()> {
    let mut stored = client.clone();
    stored.receive_bytes = 0;
    stored.transmit_bytes = 0;
    store::write_json(path, &stored).map_err(GatewayError::persistence)
}

/// Read every client file (named by UUID), ordered by creation time.
/// Unreadable records are logged and skipped.
fn load_all(dir: &Path) -> GatewayResult<Vec<Client>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(GatewayError::Persistence(format!(
                "Failed to list {:?}: {}",
                dir, e
            )))
        }
    };

    let mut clients = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if Uuid::parse_str(&name).is_err() {
            continue;
        }
        match store::read_json::<Client>(&entry.path()) {
            Ok(Some(client)) => clients.push(client),
            Ok(None) => {}
            Err(e) => warn!(path = %name, "Failed to read client record: {:#}", e),
        }
    }

    clients.sort_by_key(|c| c.created_at);
    Ok(clients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WireGuardConfig;
    use crate::services::wireguard::PeerTransfer;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Stats collaborator returning a fixed table and counting queries.
    #[derive(Default)]
    struct FakeStats {
        table: Mutex<HashMap<String, PeerTransfer>>,
        fail: bool,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl PeerStats for FakeStats {
        async fn transfer(&self) -> anyhow::Result<HashMap<String, PeerTransfer>> {
            *self.calls.lock().unwrap() += 1;
            if self.fail {
                anyhow::bail!("wg not installed");
            }
            Ok(self.table.lock().unwrap().clone())
        }
    }

    fn setup(stats: Arc<FakeStats>) -> (TempDir, ClientRegistry) {
        let dir = TempDir::new().unwrap();
        let cfg = WireGuardConfig {
            server_file: dir.path().join("server.json"),
            interface_file: dir.path().join("wg0.conf"),
            clients_dir: dir.path().join("clients"),
            address: vec!["10.0.0.1/24".to_string()],
            listen_port: 51820,
            endpoint_host: "vpn.example.com".to_string(),
            dns: vec!["1.1.1.1".to_string()],
            allowed_ips: vec!["0.0.0.0/0".to_string()],
            keepalive: 16,
            post_up: None,
            post_down: None,
        };
        let server = ServerRecord::load_or_init(&cfg).unwrap();
        let registry = ClientRegistry::new(
            cfg.clients_dir.clone(),
            cfg.interface_file.clone(),
            Arc::new(server),
            stats,
        );
        (dir, registry)
    }

    fn spec(name: &str, network: &str) -> Client {
        Client {
            name: name.to_string(),
            email: "user@example.com".to_string(),
            address: vec![network.to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sequential_registration_addresses() {
        let (_dir, registry) = setup(Arc::new(FakeStats::default()));

        let first = registry.register(spec("alice", "10.8.0.0/24")).await.unwrap();
        let second = registry.register(spec("bob", "10.8.0.0/24")).await.unwrap();

        assert_eq!(first.address, vec!["10.8.0.1/32"]);
        assert_eq!(second.address, vec!["10.8.0.2/32"]);
        assert_ne!(first.uuid, second.uuid);
        assert!(!first.preshared_key.is_empty());
        assert!(!first.private_key.is_empty());
    }

    #[tokio::test]
    async fn test_server_address_is_never_allocated() {
        let (_dir, registry) = setup(Arc::new(FakeStats::default()));

        let client = registry.register(spec("alice", "10.0.0.0/24")).await.unwrap();
        assert_eq!(client.address, vec!["10.0.0.2/32"]);
    }

    #[tokio::test]
    async fn test_concurrent_registrations_never_share_an_address() {
        let (_dir, registry) = setup(Arc::new(FakeStats::default()));

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .register(spec(&format!("client-{}", i), "10.9.0.0/24"))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            let client = h.await.unwrap();
            assert!(seen.insert(client.address[0].clone()));
        }
        assert_eq!(seen.len(), 12);
    }

    #[tokio::test]
    async fn test_validation_reports_every_violation() {
        let (_dir, registry) = setup(Arc::new(FakeStats::default()));

        let bad = Client {
            name: "x".to_string(),
            email: "not-an-email".to_string(),
            allowed_ips: vec!["nope".to_string()],
            public_key: "c2hvcnQ=".to_string(),
            ..Default::default()
        };
        match registry.register(bad).await.unwrap_err() {
            GatewayError::Validation(reasons) => assert_eq!(reasons.len(), 5),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_supplied_public_key_is_kept() {
        let (_dir, registry) = setup(Arc::new(FakeStats::default()));

        let key = KeyPair::generate().public_key_base64();
        let mut s = spec("phone", "10.8.0.0/24");
        s.public_key = key.clone();

        let client = registry.register(s).await.unwrap();
        assert_eq!(client.public_key, key);
        assert!(client.private_key.is_empty());
    }

    #[tokio::test]
    async fn test_update_preserves_keys() {
        let (_dir, registry) = setup(Arc::new(FakeStats::default()));
        let created = registry.register(spec("alice", "10.8.0.0/24")).await.unwrap();

        let mut change = created.clone();
        change.name = "alice-laptop".to_string();
        change.public_key = KeyPair::generate().public_key_base64();
        change.preshared_key = wireguard::generate_preshared_key();

        let updated = registry.update(&created.uuid, change).await.unwrap();
        assert_eq!(updated.name, "alice-laptop");
        assert_eq!(updated.public_key, created.public_key);
        assert_eq!(updated.preshared_key, created.preshared_key);
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn test_update_error_order() {
        let (_dir, registry) = setup(Arc::new(FakeStats::default()));
        let a = registry.register(spec("alice", "10.8.0.0/24")).await.unwrap();
        let b = registry.register(spec("bob", "10.8.0.0/24")).await.unwrap();

        let missing = registry.update("00000000-0000-0000-0000-000000000000", a.clone()).await;
        assert!(matches!(missing, Err(GatewayError::NotFound(_))));

        let mut stolen = b.clone();
        stolen.address = a.address.clone();
        let conflict = registry.update(&b.uuid, stolen).await;
        assert!(matches!(conflict, Err(GatewayError::Validation(_))));

        let mut wrong_id = a.clone();
        wrong_id.uuid = b.uuid.clone();
        let mismatch = registry.update(&a.uuid, wrong_id).await;
        assert!(matches!(mismatch, Err(GatewayError::Mismatch(_))));
    }

    #[tokio::test]
    async fn test_delete_and_not_found() {
        let (dir, registry) = setup(Arc::new(FakeStats::default()));
        let client = registry.register(spec("alice", "10.8.0.0/24")).await.unwrap();

        let conf = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        assert!(conf.contains(&client.public_key));

        registry.delete(&client.uuid).await.unwrap();
        assert!(matches!(
            registry.delete(&client.uuid).await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            registry.read(&client.uuid).await,
            Err(GatewayError::NotFound(_))
        ));

        let conf = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        assert!(!conf.contains(&client.public_key));
    }

    #[tokio::test]
    async fn test_list_merges_stats_once() {
        let stats = Arc::new(FakeStats::default());
        let (_dir, registry) = setup(stats.clone());

        let a = registry.register(spec("alice", "10.8.0.0/24")).await.unwrap();
        let b = registry.register(spec("bob", "10.8.0.0/24")).await.unwrap();
        stats.table.lock().unwrap().insert(
            a.public_key.clone(),
            PeerTransfer {
                received_bytes: 10,
                transmitted_bytes: 20,
            },
        );

        let clients = registry.list().await.unwrap();
        assert_eq!(*stats.calls.lock().unwrap(), 1);
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].uuid, a.uuid);
        assert_eq!(clients[0].receive_bytes, 10);
        assert_eq!(clients[1].uuid, b.uuid);
        assert_eq!(clients[1].transmit_bytes, 0);

        let ids = registry.ids().await.unwrap();
        assert_eq!(ids, vec![a.uuid, b.uuid]);
        assert_eq!(*stats.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_survives_stats_failure() {
        let stats = Arc::new(FakeStats {
            fail: true,
            ..Default::default()
        });
        let (_dir, registry) = setup(stats);

        let created = registry.register(spec("alice", "10.8.0.0/24")).await.unwrap();
        let read = registry.read(&created.uuid).await.unwrap();
        assert_eq!(read.receive_bytes, 0);
        assert_eq!(read.uuid, created.uuid);
    }

    #[tokio::test]
    async fn test_read_config_as_qr() {
        let (_dir, registry) = setup(Arc::new(FakeStats::default()));
        let created = registry.register(spec("alice", "10.8.0.0/24")).await.unwrap();

        match registry.read_config(&created.uuid, false).await.unwrap() {
            ClientConfig::Text(text) => assert!(text.contains("Address = 10.8.0.1/32")),
            ClientConfig::QrSvg(_) => panic!("expected text"),
        }
        match registry.read_config(&created.uuid, true).await.unwrap() {
            ClientConfig::QrSvg(svg) => assert!(svg.contains("<svg")),
            ClientConfig::Text(_) => panic!("expected svg"),
        }
    }

    #[test]
    fn test_email_shapes() {
        assert!(is_email("a@b.io"));
        assert!(!is_email("a@b"));
        assert!(!is_email("@b.io"));
        assert!(!is_email("a b@c.io"));
    }
}
