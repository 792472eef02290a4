use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::services::proxy_config::ProxyRenderer;
use crate::store::{self, execute_async, StoreLock};
use crate::types::{ServiceRecord, ServicesList};

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of a registration pre-check. Only I/O problems are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Ok,
    Rejected(String),
}

/// Durable `name -> route` mapping stored as `{"services": [...]}` in two
/// byte-identical copies, with the Caddy site file derived from it.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    registry_file: PathBuf,
    mirror_file: PathBuf,
    renderer: ProxyRenderer,
    node_type: String,
    service_domain: String,
    probe_host: String,
}

impl ServiceRegistry {
    pub fn new(cfg: &ProxyConfig) -> Self {
        Self {
            registry_file: cfg.registry_file.clone(),
            mirror_file: cfg.mirror_file.clone(),
            renderer: ProxyRenderer::new(cfg),
            node_type: cfg.node_type.clone(),
            service_domain: cfg.service_domain.clone(),
            probe_host: cfg.probe_host.clone(),
        }
    }

    pub async fn validate(&self, name: &str, port: u16, ip: &str) -> GatewayResult<Validation> {
        let current = self.read_services().await?;
        Ok(check(&current.services, name, port, ip))
    }

    /// Check `name` against the route rules and the routes registered so far.
    /// Reads only; the registry file is not created.
    pub async fn validate_name(&self, name: &str) -> GatewayResult<Validation> {
        let current = self.snapshot().await?;
        Ok(check_name(&current.services, name))
    }

    /// Register a route for `<name>.<service-domain>`.
    pub async fn add_service(&self, name: &str, ip: &str, port: u16) -> GatewayResult<ServiceRecord> {
        let record = self.record(name, ip, port, format!("{}.{}", name, self.service_domain));
        self.insert(record).await
    }

    /// Register the route fronting an agent container on this host.
    pub async fn add_agent_route(&self, name: &str, domain: &str, port: u16) -> GatewayResult<ServiceRecord> {
        let record = self.record(name, "127.0.0.1", port, domain.to_string());
        self.insert(record).await
    }

    fn record(&self, name: &str, ip: &str, port: u16, domain: String) -> ServiceRecord {
        ServiceRecord {
            name: name.to_string(),
            service_type: self.node_type.clone(),
            ip_address: ip.to_string(),
            port,
            domain,
            status: String::new(),
            created_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
        }
    }

    // Validation and the append happen under one lock, so two concurrent
    // registrations can never both pass the uniqueness checks.
    async fn insert(&self, record: ServiceRecord) -> GatewayResult<ServiceRecord> {
        let this = self.clone();
        execute_async(move || {
            let _lock = StoreLock::for_file(&this.registry_file).map_err(GatewayError::persistence)?;

            let mut current = this.load()?;
            if let Validation::Rejected(reason) =
                check(&current.services, &record.name, record.port, &record.ip_address)
            {
                return Err(GatewayError::invalid(reason));
            }

            current.services.push(record.clone());
            this.commit(&current)?;
            info!(service = %record.name, domain = %record.domain, "Added service route");
            Ok(record)
        })
        .await
    }

    /// Remove every route named `name`. Removing an unknown name succeeds.
    pub async fn delete_service(&self, name: &str) -> GatewayResult<bool> {
        let this = self.clone();
        let name = name.to_string();
        execute_async(move || {
            let _lock = StoreLock::for_file(&this.registry_file).map_err(GatewayError::persistence)?;

            let mut current = this.load()?;
            let before = current.services.len();
            current.services.retain(|s| s.name != name);
            let removed = current.services.len() != before;

            this.commit(&current)?;
            if removed {
                info!(service = %name, "Deleted service route");
            } else {
                debug!(service = %name, "Delete of unknown service route");
            }
            Ok(removed)
        })
        .await
    }

    /// Current registry; a missing file is created empty.
    pub async fn read_services(&self) -> GatewayResult<ServicesList> {
        let this = self.clone();
        execute_async(move || {
            let _lock = StoreLock::for_file(&this.registry_file).map_err(GatewayError::persistence)?;
            if !this.registry_file.exists() {
                store::write_json(&this.registry_file, &ServicesList::default())
                    .map_err(GatewayError::persistence)?;
            }
            this.load()
        })
        .await
    }

    /// Current registry without creating it; a missing file reads as empty.
    pub async fn snapshot(&self) -> GatewayResult<ServicesList> {
        let this = self.clone();
        execute_async(move || this.load()).await
    }

    pub async fn read_service(&self, name: &str) -> GatewayResult<Option<ServiceRecord>> {
        let list = self.read_services().await?;
        Ok(list.services.into_iter().find(|s| s.name == name))
    }

    /// `active` when `<probe-host>:<port>` accepts a TCP connection within 500 ms.
    pub async fn probe_status(&self, port: u16) -> &'static str {
        let target = format!("{}:{}", self.probe_host, port);
        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&target)).await {
            Ok(Ok(_)) => "active",
            _ => "inactive",
        }
    }

    /// Re-render the site file from the stored registry.
    pub async fn sync_site_file(&self) -> GatewayResult<()> {
        let this = self.clone();
        execute_async(move || {
            let _lock = StoreLock::for_file(&this.registry_file).map_err(GatewayError::persistence)?;
            let current = this.load()?;
            this.renderer.apply(&current.services)
        })
        .await
    }

    fn load(&self) -> GatewayResult<ServicesList> {
        Ok(store::read_json(&self.registry_file)
            .map_err(GatewayError::persistence)?
            .unwrap_or_default())
    }

    // Both copies come from one buffer. The registry is committed before the
    // render, so a render failure is reported with the new registry in place.
    fn commit(&self, list: &ServicesList) -> GatewayResult<()> {
        let bytes = store::to_pretty_json(list).map_err(GatewayError::persistence)?;
        write_copy(&self.registry_file, &bytes)?;
        write_copy(&self.mirror_file, &bytes)?;
        self.renderer.apply(&list.services)
    }
}

fn write_copy(path: &Path, bytes: &[u8]) -> GatewayResult<()> {
    store::write_atomic(path, bytes).map_err(GatewayError::persistence)
}

/// Registration rules against the current set of routes.
pub fn check(services: &[ServiceRecord], name: &str, port: u16, ip: &str) -> Validation {
    if let Validation::Rejected(reason) = check_name(services, name) {
        return Validation::Rejected(reason);
    }

    if ip.parse::<IpAddr>().is_err() {
        return Validation::Rejected(format!("Invalid IP address {:?}", ip));
    }

    if port == 0 {
        return Validation::Rejected("Port is required".to_string());
    }

    if services.iter().any(|s| s.ip_address == ip && s.port == port) {
        return Validation::Rejected("Port and IP address combination already in use".to_string());
    }

    Validation::Ok
}

/// Name rules alone, for callers that have no backend yet.
pub fn check_name(services: &[ServiceRecord], name: &str) -> Validation {
    if name.is_empty() {
        return Validation::Rejected("Services Name is required".to_string());
    }

    let len = name.chars().count();
    if !(4..=50).contains(&len) {
        return Validation::Rejected("Services Name field must be between 4-50 chars".to_string());
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Validation::Rejected(
            "Services Name may only contain letters, digits, '-' and '_'".to_string(),
        );
    }

    if services.iter().any(|s| s.name == name) {
        return Validation::Rejected("Service Already exists".to_string());
    }

    Validation::Ok
}
