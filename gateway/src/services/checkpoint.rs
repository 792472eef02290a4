use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::services::agent_ledger::AgentLedger;
use crate::services::client_registry::ClientRegistry;
use crate::services::service_registry::ServiceRegistry;

/// Liveness and size snapshot of this node, anchored externally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeCheckpoint {
    pub node_name: String,
    pub hostname: String,
    pub cpu_cores: u32,
    pub ram_mb: u64,
    pub clients: usize,
    pub agents: usize,
    pub services: usize,
    /// Hex SHA-256 of the sorted client ids, one per line
    pub clients_digest: String,
    pub timestamp: String,
}

#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn submit(&self, checkpoint: &NodeCheckpoint) -> Result<()>;
}

pub struct HttpCheckpointSink {
    url: String,
    client: Client,
}

impl HttpCheckpointSink {
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { url, client })
    }
}

#[async_trait]
impl CheckpointSink for HttpCheckpointSink {
    async fn submit(&self, checkpoint: &NodeCheckpoint) -> Result<()> {
        debug!("Sending checkpoint to {}", self.url);

        let resp = self
            .client
            .post(&self.url)
            .json(checkpoint)
            .send()
            .await
            .context("Failed to send checkpoint")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Checkpoint rejected ({}): {}", status, body);
        }

        Ok(())
    }
}

/// Reads the registries to build a [`NodeCheckpoint`].
#[derive(Clone)]
pub struct CheckpointSource {
    pub node_name: String,
    pub clients: ClientRegistry,
    pub agents: AgentLedger,
    pub services: ServiceRegistry,
}

impl CheckpointSource {
    pub async fn collect(&self) -> Result<NodeCheckpoint> {
        let ids = self.clients.ids().await?;
        let agents = self.agents.list().await?;
        let services = self.services.snapshot().await?;

        Ok(NodeCheckpoint {
            node_name: self.node_name.clone(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_default(),
            cpu_cores: num_cpus::get() as u32,
            ram_mb: total_memory_mb(),
            clients: ids.len(),
            agents: agents.len(),
            services: services.services.len(),
            clients_digest: clients_digest(ids),
            timestamp: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        })
    }
}

pub fn clients_digest(mut ids: Vec<String>) -> String {
    ids.sort();
    let mut hasher = Sha256::new();
    for id in &ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Total system memory in MB (best effort)
fn total_memory_mb() -> u64 {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory() / 1024 / 1024
}

/// Background task submitting a checkpoint every `interval` until `cancel` fires.
pub async fn checkpoint_loop(
    source: CheckpointSource,
    sink: Arc<dyn CheckpointSink>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Starting checkpoint loop (interval {:?})", interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Checkpoint loop stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let checkpoint = match source.collect().await {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to collect checkpoint: {:#}", e);
                continue;
            }
        };

        match sink.submit(&checkpoint).await {
            Ok(()) => info!(
                clients = checkpoint.clients,
                agents = checkpoint.agents,
                services = checkpoint.services,
                "Checkpoint submitted"
            ),
            Err(e) => error!("Checkpoint submission failed: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, ProxyConfig, WireGuardConfig};
    use crate::services::agent_api::fake::FakeEndpoint;
    use crate::services::container_runtime::fake::FakeRuntime;
    use crate::services::wireguard::{PeerStats, PeerTransfer, ServerRecord};
    use crate::types::Client;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingStats {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PeerStats for CountingStats {
        async fn transfer(&self) -> Result<HashMap<String, PeerTransfer>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HashMap::new())
        }
    }

    fn source(dir: &std::path::Path, stats: Arc<CountingStats>) -> CheckpointSource {
        let wg = WireGuardConfig {
            server_file: dir.join("server.json"),
            interface_file: dir.join("wg0.conf"),
            clients_dir: dir.join("clients"),
            address: vec!["10.0.0.1/24".to_string()],
            listen_port: 51820,
            endpoint_host: "vpn.example.com".to_string(),
            dns: vec![],
            allowed_ips: vec!["0.0.0.0/0".to_string()],
            keepalive: 16,
            post_up: None,
            post_down: None,
        };
        let server = Arc::new(ServerRecord::load_or_init(&wg).unwrap());
        let proxy = ProxyConfig {
            registry_file: dir.join("caddy/caddy.json"),
            mirror_file: dir.join("mirror/caddy.json"),
            site_file: dir.join("caddy/erebrus.caddy"),
            log_dir: "/var/log/caddy".to_string(),
            tls_email: "ops@example.com".to_string(),
            node_type: "nexus".to_string(),
            service_domain: "node.example.com".to_string(),
            probe_host: "127.0.0.1".to_string(),
        };
        let agents = AgentConfig {
            ledger_file: dir.join("agents.json"),
            characters_dir: dir.join("characters"),
            image: Some("agent:latest".to_string()),
            pull_image: false,
            domain: "agents.example.com".to_string(),
            readiness_timeout: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(15),
        };
        let services = ServiceRegistry::new(&proxy);
        CheckpointSource {
            node_name: "node-1".to_string(),
            clients: ClientRegistry::new(wg.clients_dir.clone(), wg.interface_file.clone(), server, stats),
            agents: AgentLedger::new(
                agents,
                Arc::new(FakeRuntime::new()),
                Arc::new(FakeEndpoint::default()),
                services.clone(),
                CancellationToken::new(),
            ),
            services,
        }
    }

    #[tokio::test]
    async fn test_collect_reads_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let stats = Arc::new(CountingStats::default());
        let src = source(dir.path(), stats.clone());

        let client = src
            .clients
            .register(Client {
                name: "laptop".to_string(),
                email: "me@example.com".to_string(),
                address: vec!["10.0.0.0/24".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        let checkpoint = src.collect().await.unwrap();
        assert_eq!(checkpoint.node_name, "node-1");
        assert_eq!(checkpoint.clients, 1);
        assert_eq!(checkpoint.agents, 0);
        assert_eq!(checkpoint.services, 0);
        assert_eq!(checkpoint.clients_digest, clients_digest(vec![client.uuid]));

        assert_eq!(stats.calls.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("caddy/caddy.json").exists());
    }

    #[test]
    fn test_digest_ignores_order() {
        let a = clients_digest(vec!["b".to_string(), "a".to_string()]);
        let b = clients_digest(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, clients_digest(vec!["a".to_string()]));
    }

    fn sample() -> NodeCheckpoint {
        NodeCheckpoint {
            node_name: "node-1".to_string(),
            hostname: "host".to_string(),
            cpu_cores: 4,
            ram_mb: 8192,
            clients: 2,
            agents: 1,
            services: 3,
            clients_digest: clients_digest(vec![]),
            timestamp: "2024-05-01T10:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn test_http_sink_posts_json() {
        let received: Arc<Mutex<Vec<NodeCheckpoint>>> = Arc::default();
        let sink_state = received.clone();
        let app = Router::new()
            .route(
                "/checkpoint",
                post(move |Json(body): Json<NodeCheckpoint>| {
                    let sink_state = sink_state.clone();
                    async move {
                        sink_state.lock().unwrap().push(body);
                        StatusCode::OK
                    }
                }),
            )
            .route("/reject", post(|| async { StatusCode::BAD_REQUEST }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let sink = HttpCheckpointSink::new(format!("http://{}/checkpoint", addr)).unwrap();
        sink.submit(&sample()).await.unwrap();
        assert_eq!(received.lock().unwrap().as_slice(), &[sample()]);

        let rejecting = HttpCheckpointSink::new(format!("http://{}/reject", addr)).unwrap();
        assert!(rejecting.submit(&sample()).await.is_err());
    }
}
