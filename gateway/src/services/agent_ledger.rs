//! Desired state of the agent fleet (`agents.json`) and the provisioning flow
//! that adds to it.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::services::agent_api::AgentEndpoint;
use crate::services::container_runtime::{ContainerRuntime, ContainerSpec};
use crate::services::ports::{self, Reservations};
use crate::services::service_registry::{check_name, ServiceRegistry, Validation};
use crate::store::{self, execute_async, StoreLock};
use crate::types::{AgentRecord, AgentStatus, CharacterFile, CreateAgentResponse};

/// A character upload plus the optional presentation fields sent with it.
#[derive(Debug, Clone, Default)]
pub struct AgentUpload {
    pub file_name: String,
    pub contents: Vec<u8>,
    pub avatar_img: String,
    pub cover_img: String,
    pub voice_model: String,
    pub organization: String,
    /// Per-request image override
    pub docker_url: Option<String>,
    /// Per-request base domain override
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    Pause,
    Resume,
}

impl AgentAction {
    pub fn parse(action: &str) -> GatewayResult<Self> {
        match action {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            _ => Err(GatewayError::invalid(
                "Invalid action. Use 'pause' or 'resume'",
            )),
        }
    }
}

#[derive(Clone)]
pub struct AgentLedger {
    cfg: AgentConfig,
    runtime: Arc<dyn ContainerRuntime>,
    endpoint: Arc<dyn AgentEndpoint>,
    services: ServiceRegistry,
    names: Reservations<String>,
    ports: Reservations<u16>,
    fleet: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

impl AgentLedger {
    pub fn new(
        cfg: AgentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        endpoint: Arc<dyn AgentEndpoint>,
        services: ServiceRegistry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            runtime,
            endpoint,
            services,
            names: Reservations::new(),
            ports: Reservations::new(),
            fleet: Arc::new(Mutex::new(())),
            cancel,
        }
    }

    pub async fn list(&self) -> GatewayResult<Vec<AgentRecord>> {
        let file = self.cfg.ledger_file.clone();
        execute_async(move || load(&file)).await
    }

    pub async fn get(&self, id: &str) -> GatewayResult<AgentRecord> {
        self.find(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("agent {}", id)))
    }

    pub async fn find(&self, id: &str) -> GatewayResult<Option<AgentRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|a| a.id.eq_ignore_ascii_case(id)))
    }

    /// Held for container work on agents already in the ledger: delete,
    /// pause/resume and reconciler repairs.
    pub async fn lock_fleet(&self) -> OwnedMutexGuard<()> {
        self.fleet.clone().lock_owned().await
    }

    /// How the container for `agent` is (re)created.
    pub fn container_spec(&self, agent: &AgentRecord) -> Option<ContainerSpec> {
        let image = agent.image.clone().or_else(|| self.cfg.image.clone())?;
        let character_file = agent
            .character_file
            .clone()
            .unwrap_or_else(|| format!("{}.character.json", agent.name));

        Some(ContainerSpec {
            name: agent.name.clone(),
            image,
            host_port: agent.port,
            characters_dir: self.cfg.characters_dir.clone(),
            character_file,
        })
    }

    /// Provision a new agent from an uploaded character definition.
    ///
    /// Stages: parse upload, store it, pull the image, claim a port, start the
    /// container, wait for readiness, register the route, fetch the reported
    /// identity, then commit to the ledger. Every name rule is checked before
    /// the first write. A failure after the upload removes the stored
    /// character directory; once the container is running it is stopped and
    /// removed again (and its route, if registered).
    pub async fn add_agent(&self, upload: AgentUpload) -> GatewayResult<CreateAgentResponse> {
        let character: CharacterFile = serde_json::from_slice(&upload.contents)
            .map_err(|e| GatewayError::Upload(format!("Invalid JSON file: {}", e)))?;
        let name = character.name.trim().to_string();
        if name.is_empty() {
            return Err(GatewayError::Upload(
                "'name' field is required in the JSON file".to_string(),
            ));
        }
        validate_agent_name(&name)?;
        // Every agent is also a route named after it.
        if let Validation::Rejected(reason) = check_name(&[], &name) {
            return Err(GatewayError::invalid(reason));
        }

        let file_name = sanitize_file_name(&upload.file_name)
            .unwrap_or_else(|| format!("{}.character.json", name));

        let image = upload
            .docker_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| self.cfg.image.clone())
            .ok_or_else(|| GatewayError::invalid("No agent image configured and no docker_url given"))?;

        let base_domain = upload
            .domain
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| self.cfg.domain.clone());
        validate_domain(&base_domain)?;
        let domain = format!("{}.{}", name, base_domain);

        let _name_claim = self
            .names
            .try_reserve(name.to_ascii_lowercase())
            .ok_or_else(|| GatewayError::invalid(format!("Agent {} is already being created", name)))?;

        let existing = self.list().await?;
        if existing.iter().any(|a| a.name.eq_ignore_ascii_case(&name)) {
            return Err(GatewayError::invalid(format!("Agent {} already exists", name)));
        }
        if let Validation::Rejected(reason) = self.services.validate_name(&name).await? {
            return Err(GatewayError::invalid(reason));
        }

        // Upload
        let target = self.cfg.characters_dir.join(&name).join(&file_name);
        let contents = upload.contents.clone();
        let stored = target.clone();
        execute_async(move || {
            store::write_atomic(&stored, &contents)
                .map_err(|e| GatewayError::Upload(format!("Failed to save character file: {:#}", e)))
        })
        .await?;
        info!(agent = %name, path = ?target, "Stored character file");

        let spec = ContainerSpec {
            name: name.clone(),
            image,
            host_port: 0,
            characters_dir: self.cfg.characters_dir.clone(),
            character_file: file_name,
        };

        match self.launch(&upload, spec, &domain, &existing).await {
            Ok(agent) => {
                info!(agent = %agent.name, agent_id = %agent.id, domain = %domain, "Agent created");
                Ok(CreateAgentResponse { agent, domain })
            }
            Err(e) => {
                self.remove_character_dir(&name).await;
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        upload: &AgentUpload,
        mut spec: ContainerSpec,
        domain: &str,
        existing: &[AgentRecord],
    ) -> GatewayResult<AgentRecord> {
        let name = spec.name.clone();

        // Image
        if self.cfg.pull_image {
            self.runtime
                .pull(&spec.image)
                .await
                .map_err(|e| GatewayError::ImagePull(format!("{:#}", e)))?;
        }

        // Port
        let services = self.services.snapshot().await?;
        let mut in_use: HashSet<u16> = existing.iter().map(|a| a.port).collect();
        in_use.extend(services.services.iter().map(|s| s.port));
        let port_claim = ports::reserve_port(&self.ports, &in_use)?;
        spec.host_port = *port_claim.value();

        if let Validation::Rejected(reason) =
            self.services.validate(&name, spec.host_port, "127.0.0.1").await?
        {
            return Err(GatewayError::invalid(reason));
        }

        // Container
        info!(agent = %name, port = spec.host_port, image = %spec.image, "Starting agent container");
        self.runtime
            .run(&spec)
            .await
            .map_err(|e| GatewayError::ContainerStart(format!("{:#}", e)))?;

        let mut route_added = false;
        let result = self
            .finish_provisioning(upload, &spec, domain, &mut route_added)
            .await;

        if let Err(e) = &result {
            error!(agent = %name, "Agent provisioning failed, cleaning up: {}", e);
            self.discard(&name, route_added).await;
        }
        result
    }

    async fn finish_provisioning(
        &self,
        upload: &AgentUpload,
        spec: &ContainerSpec,
        domain: &str,
        route_added: &mut bool,
    ) -> GatewayResult<AgentRecord> {
        let name = &spec.name;

        if !self
            .endpoint
            .wait_ready(spec.host_port, self.cfg.readiness_timeout, &self.cancel)
            .await
        {
            // Not fatal: the reconciler takes over from here.
            warn!(
                agent = %name,
                "{}",
                GatewayError::ReadinessTimeout(name.clone())
            );
        }

        self.services
            .add_agent_route(name, domain, spec.host_port)
            .await
            .map_err(|e| GatewayError::RouteRegistration(e.to_string()))?;
        *route_added = true;

        let reported = self
            .endpoint
            .list_agents(spec.host_port)
            .await
            .map_err(|e| GatewayError::ExternalService(format!("{:#}", e)))?;
        let identity = reported
            .into_iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| GatewayError::AgentNotFound(name.clone()))?;

        let record = AgentRecord {
            id: identity.id,
            name: name.clone(),
            clients: identity.clients,
            port: spec.host_port,
            domain: domain.to_string(),
            status: AgentStatus::Active,
            avatar_img: upload.avatar_img.clone(),
            cover_img: upload.cover_img.clone(),
            voice_model: upload.voice_model.clone(),
            organization: upload.organization.clone(),
            character_file: Some(spec.character_file.clone()),
            image: Some(spec.image.clone()),
        };

        let file = self.cfg.ledger_file.clone();
        let committed = record.clone();
        execute_async(move || {
            let _lock = StoreLock::for_file(&file).map_err(GatewayError::persistence)?;
            let mut agents = load(&file)?;
            if let Some(clash) = agents.iter().find(|a| {
                a.name.eq_ignore_ascii_case(&committed.name)
                    || a.port == committed.port
                    || a.id.eq_ignore_ascii_case(&committed.id)
            }) {
                return Err(GatewayError::invalid(format!(
                    "Agent {} conflicts with existing agent {}",
                    committed.name, clash.name
                )));
            }
            agents.push(committed);
            save(&file, &agents)
        })
        .await?;

        Ok(record)
    }

    // Best effort: the error that triggered cleanup is what the caller sees.
    async fn discard(&self, name: &str, route_added: bool) {
        if let Err(e) = self.runtime.stop(name).await {
            warn!(agent = %name, "Cleanup stop failed: {:#}", e);
        }
        if let Err(e) = self.runtime.remove(name).await {
            warn!(agent = %name, "Cleanup remove failed: {:#}", e);
        }
        if route_added {
            if let Err(e) = self.services.delete_service(name).await {
                warn!(agent = %name, "Cleanup route removal failed: {}", e);
            }
        }
    }

    async fn remove_character_dir(&self, name: &str) {
        let dir = self.cfg.characters_dir.join(name);
        let result = execute_async(move || {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| GatewayError::Persistence(format!("Failed to remove {:?}: {}", dir, e)))
        })
        .await;
        if let Err(e) = result {
            warn!(agent = %name, "Cleanup of character file failed: {}", e);
        }
    }

    /// Remove the container, its route and the ledger entry. A container
    /// failure aborts before the ledger is touched.
    pub async fn delete_agent(&self, id: &str) -> GatewayResult<AgentRecord> {
        let _fleet = self.lock_fleet().await;
        let agent = self.get(id).await?;

        self.runtime
            .stop(&agent.name)
            .await
            .map_err(|e| GatewayError::ContainerOp(format!("stop {}: {:#}", agent.name, e)))?;
        self.runtime
            .remove(&agent.name)
            .await
            .map_err(|e| GatewayError::ContainerOp(format!("rm {}: {:#}", agent.name, e)))?;

        if let Err(e) = self.services.delete_service(&agent.name).await {
            warn!(agent = %agent.name, "Failed to remove agent route: {}", e);
        }

        let file = self.cfg.ledger_file.clone();
        let agent_id = agent.id.clone();
        execute_async(move || {
            let _lock = StoreLock::for_file(&file).map_err(GatewayError::persistence)?;
            let mut agents = load(&file)?;
            agents.retain(|a| !a.id.eq_ignore_ascii_case(&agent_id));
            save(&file, &agents)
        })
        .await?;

        info!(agent = %agent.name, agent_id = %agent.id, "Agent deleted");
        Ok(agent)
    }

    /// Record the desired status first, then apply it to the container.
    pub async fn manage_agent(&self, id: &str, action: &str) -> GatewayResult<AgentRecord> {
        let action = AgentAction::parse(action)?;
        let status = match action {
            AgentAction::Pause => AgentStatus::Inactive,
            AgentAction::Resume => AgentStatus::Active,
        };

        let _fleet = self.lock_fleet().await;
        let file = self.cfg.ledger_file.clone();
        let wanted = id.to_string();
        let agent = execute_async(move || {
            let _lock = StoreLock::for_file(&file).map_err(GatewayError::persistence)?;
            let mut agents = load(&file)?;
            let agent = agents
                .iter_mut()
                .find(|a| a.id.eq_ignore_ascii_case(&wanted))
                .ok_or_else(|| GatewayError::NotFound(format!("agent {}", wanted)))?;
            agent.status = status;
            let updated = agent.clone();
            save(&file, &agents)?;
            Ok(updated)
        })
        .await?;

        let op = match action {
            AgentAction::Pause => self.runtime.pause(&agent.name).await,
            AgentAction::Resume => self.runtime.unpause(&agent.name).await,
        };
        op.map_err(|e| GatewayError::ContainerOp(format!("{:?} {}: {:#}", action, agent.name, e)))?;

        info!(agent = %agent.name, status = agent.status.as_str(), "Agent status changed");
        Ok(agent)
    }
}

fn load(file: &Path) -> GatewayResult<Vec<AgentRecord>> {
    Ok(store::read_json(file)
        .map_err(GatewayError::persistence)?
        .unwrap_or_default())
}

fn save(file: &Path, agents: &[AgentRecord]) -> GatewayResult<()> {
    store::write_json(file, &agents).map_err(GatewayError::persistence)
}

/// Container names double as DNS labels in `<name>.<domain>`.
pub fn validate_agent_name(name: &str) -> GatewayResult<()> {
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if !first_ok || !rest_ok || name.len() > 63 {
        return Err(GatewayError::invalid(format!(
            "Agent name {:?} must start with a letter or digit and contain only letters, digits, '-' or '_' (max 63)",
            name
        )));
    }
    Ok(())
}

fn validate_domain(domain: &str) -> GatewayResult<()> {
    let ok = !domain.is_empty()
        && domain
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    if !ok {
        return Err(GatewayError::invalid(format!("Invalid domain {:?}", domain)));
    }
    Ok(())
}

/// Keep only the final path component, and only if it is a plain file name.
fn sanitize_file_name(raw: &str) -> Option<String> {
    let base = Path::new(raw).file_name()?.to_str()?;
    let plain = !base.starts_with('.')
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    plain.then(|| base.to_string())
}
