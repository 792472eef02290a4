use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "erebrus-gateway")]
#[command(about = "Erebrus VPN node gateway", long_about = None)]
pub struct Args {
    /// Bind address for HTTP server
    #[arg(long, env = "EREBRUS_BIND", default_value = "0.0.0.0:9080")]
    pub bind: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Directory holding caddy.json and the generated site file
    #[arg(long, env = "CADDY_CONF_DIR", default_value = "/etc/caddy")]
    pub caddy_conf_dir: PathBuf,

    /// File name of the generated site file inside the Caddy config dir
    #[arg(long, env = "CADDY_INTERFACE_NAME", default_value = "erebrus.caddy")]
    pub caddy_interface_name: String,

    /// Mirror directory for caddy.json (relative paths are joined to $HOME)
    #[arg(long, env = "SERVICE_CONF_DIR", default_value = "erebrus")]
    pub service_conf_dir: PathBuf,

    /// Directory for per-site access logs written by Caddy
    #[arg(long, env = "CADDY_LOG_DIR", default_value = "/var/log/caddy")]
    pub caddy_log_dir: String,

    /// ACME account email used in every site's tls directive
    #[arg(long, env = "CADDY_TLS_EMAIL", default_value = "support@erebrus.io")]
    pub tls_email: String,

    /// Base domain for routes created through the service API
    #[arg(long, env = "DOMAIN", default_value = "localhost")]
    pub service_domain: String,

    /// Tag stored as the type of every route
    #[arg(long, env = "NODE_TYPE", default_value = "nexus")]
    pub node_type: String,

    /// Host dialled when probing service liveness
    #[arg(long, env = "SERVER", default_value = "127.0.0.1")]
    pub probe_host: String,

    /// WireGuard configuration directory (server.json, interface file)
    #[arg(long, env = "WG_CONF_DIR", default_value = "/etc/wireguard")]
    pub wg_conf_dir: PathBuf,

    /// Generated WireGuard interface file name
    #[arg(long, env = "WG_INTERFACE_NAME", default_value = "wg0.conf")]
    pub wg_interface_name: String,

    /// Directory of per-client JSON records
    #[arg(long, env = "WG_CLIENTS_DIR", default_value = "/etc/wireguard/clients")]
    pub wg_clients_dir: PathBuf,

    /// Server interface addresses (CIDR, comma separated)
    #[arg(long, env = "WG_IPV4_SUBNET", value_delimiter = ',', default_value = "10.0.0.1/24")]
    pub wg_address: Vec<String>,

    /// WireGuard listen port
    #[arg(long, env = "WG_ENDPOINT_PORT", default_value_t = 51820)]
    pub wg_listen_port: u16,

    /// Public host clients connect to
    #[arg(long, env = "WG_ENDPOINT_HOST", default_value = "127.0.0.1")]
    pub wg_endpoint_host: String,

    /// DNS servers pushed to clients
    #[arg(long, env = "WG_DNS", value_delimiter = ',', default_value = "1.1.1.1")]
    pub wg_dns: Vec<String>,

    /// Default client AllowedIPs
    #[arg(long, env = "WG_ALLOWED_IPS", value_delimiter = ',', default_value = "0.0.0.0/0,::/0")]
    pub wg_allowed_ips: Vec<String>,

    /// PersistentKeepalive for clients (0 disables)
    #[arg(long, env = "WG_KEEPALIVE", default_value_t = 16)]
    pub wg_keepalive: u16,

    #[arg(long, env = "WG_POST_UP")]
    pub wg_post_up: Option<String>,

    #[arg(long, env = "WG_POST_DOWN")]
    pub wg_post_down: Option<String>,

    /// Agent ledger file (defaults to $HOME/erebrus/agents.json)
    #[arg(long, env = "AGENTS_FILE")]
    pub agents_file: Option<PathBuf>,

    /// Directory where uploaded character files are kept
    #[arg(long, env = "CHARACTERS_DIR", default_value = "./characters")]
    pub characters_dir: PathBuf,

    /// Container image for agents
    #[arg(long, env = "DOCKER_IMAGE_AGENT")]
    pub agent_image: Option<String>,

    /// Pull the agent image before each start
    #[arg(long, env = "PULL_AGENT_IMAGE", default_value_t = true, action = clap::ArgAction::Set)]
    pub pull_agent_image: bool,

    /// Base domain for agent routes (<name>.<domain>)
    #[arg(long, env = "EREBRUS_DOMAIN", default_value = "localhost")]
    pub agent_domain: String,

    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 15)]
    pub reconcile_interval_secs: u64,

    #[arg(long, env = "AGENT_READINESS_TIMEOUT_SECS", default_value_t = 60)]
    pub readiness_timeout_secs: u64,

    /// Node name reported in checkpoints (defaults to hostname)
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Endpoint receiving periodic node checkpoints
    #[arg(long, env = "CHECKPOINT_URL")]
    pub checkpoint_url: Option<String>,

    #[arg(long, env = "CHECKPOINT_INTERVAL_SECS", default_value_t = 300)]
    pub checkpoint_interval_secs: u64,

    /// Text prepended to every authentication challenge
    #[arg(long, env = "AUTH_EULA", default_value = "")]
    pub auth_eula: String,

    #[arg(long, env = "CHALLENGE_TTL_SECS", default_value_t = 300)]
    pub challenge_ttl_secs: u64,

    /// PEM certificate for serving the API over TLS
    #[arg(long, env = "API_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for serving the API over TLS
    #[arg(long, env = "API_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

/// Where the service registry and the rendered proxy config live.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub registry_file: PathBuf,
    pub mirror_file: PathBuf,
    pub site_file: PathBuf,
    pub log_dir: String,
    pub tls_email: String,
    pub node_type: String,
    pub service_domain: String,
    pub probe_host: String,
}

#[derive(Debug, Clone)]
pub struct WireGuardConfig {
    pub server_file: PathBuf,
    pub interface_file: PathBuf,
    pub clients_dir: PathBuf,
    pub address: Vec<String>,
    pub listen_port: u16,
    pub endpoint_host: String,
    pub dns: Vec<String>,
    pub allowed_ips: Vec<String>,
    pub keepalive: u16,
    pub post_up: Option<String>,
    pub post_down: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub ledger_file: PathBuf,
    pub characters_dir: PathBuf,
    pub image: Option<String>,
    pub pull_image: bool,
    pub domain: String,
    pub readiness_timeout: Duration,
    pub reconcile_interval: Duration,
}

/// Settings resolved once at start-up and shared by every component.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub proxy: ProxyConfig,
    pub wireguard: WireGuardConfig,
    pub agents: AgentConfig,
    pub node_name: String,
    pub checkpoint_url: Option<String>,
    pub checkpoint_interval: Duration,
    pub auth_eula: String,
    pub challenge_ttl: Duration,
}

/// Port every agent image listens on inside its container.
pub const AGENT_CONTAINER_PORT: u16 = 3000;

/// Mount point of the characters directory inside agent containers.
pub const AGENT_CHARACTERS_MOUNT: &str = "/app/characters";

impl Args {
    pub fn resolve(&self) -> Result<GatewayConfig> {
        let home = dirs::home_dir();

        let mirror_dir = if self.service_conf_dir.is_absolute() {
            self.service_conf_dir.clone()
        } else {
            home.as_deref()
                .context("Cannot determine home directory for SERVICE_CONF_DIR")?
                .join(&self.service_conf_dir)
        };

        let ledger_file = match &self.agents_file {
            Some(path) => path.clone(),
            None => home
                .as_deref()
                .context("Cannot determine home directory for the agent ledger")?
                .join("erebrus")
                .join("agents.json"),
        };

        let node_name = match &self.node_name {
            Some(name) => name.clone(),
            None => hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "erebrus-node".to_string()),
        };

        Ok(GatewayConfig {
            proxy: ProxyConfig {
                registry_file: self.caddy_conf_dir.join(SERVICES_FILE_NAME),
                mirror_file: mirror_dir.join(SERVICES_FILE_NAME),
                site_file: self.caddy_conf_dir.join(&self.caddy_interface_name),
                log_dir: self.caddy_log_dir.clone(),
                tls_email: self.tls_email.clone(),
                node_type: self.node_type.clone(),
                service_domain: self.service_domain.clone(),
                probe_host: self.probe_host.clone(),
            },
            wireguard: WireGuardConfig {
                server_file: self.wg_conf_dir.join("server.json"),
                interface_file: self.wg_conf_dir.join(&self.wg_interface_name),
                clients_dir: self.wg_clients_dir.clone(),
                address: trimmed(&self.wg_address),
                listen_port: self.wg_listen_port,
                endpoint_host: self.wg_endpoint_host.clone(),
                dns: trimmed(&self.wg_dns),
                allowed_ips: trimmed(&self.wg_allowed_ips),
                keepalive: self.wg_keepalive,
                post_up: self.wg_post_up.clone(),
                post_down: self.wg_post_down.clone(),
            },
            agents: AgentConfig {
                ledger_file,
                characters_dir: absolutize(&self.characters_dir)?,
                image: self.agent_image.clone().filter(|i| !i.trim().is_empty()),
                pull_image: self.pull_agent_image,
                domain: self.agent_domain.clone(),
                readiness_timeout: Duration::from_secs(self.readiness_timeout_secs),
                reconcile_interval: Duration::from_secs(self.reconcile_interval_secs.max(1)),
            },
            node_name,
            checkpoint_url: self.checkpoint_url.clone().filter(|u| !u.trim().is_empty()),
            checkpoint_interval: Duration::from_secs(self.checkpoint_interval_secs.max(1)),
            auth_eula: self.auth_eula.clone(),
            challenge_ttl: Duration::from_secs(self.challenge_ttl_secs.max(1)),
        })
    }
}

pub const SERVICES_FILE_NAME: &str = "caddy.json";

fn trimmed(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

// Docker bind mounts need an absolute host path.
fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Cannot determine working directory")?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_paths() {
        let args = Args::parse_from([
            "erebrus-gateway",
            "--caddy-conf-dir",
            "/tmp/caddy",
            "--service-conf-dir",
            "/tmp/mirror",
            "--agents-file",
            "/tmp/agents.json",
            "--wg-address",
            "10.0.0.1/24, fd42::1/64",
        ]);
        let cfg = args.resolve().unwrap();

        assert_eq!(cfg.proxy.registry_file, PathBuf::from("/tmp/caddy/caddy.json"));
        assert_eq!(cfg.proxy.mirror_file, PathBuf::from("/tmp/mirror/caddy.json"));
        assert_eq!(cfg.proxy.site_file, PathBuf::from("/tmp/caddy/erebrus.caddy"));
        assert_eq!(cfg.agents.ledger_file, PathBuf::from("/tmp/agents.json"));
        assert_eq!(cfg.wireguard.address, vec!["10.0.0.1/24", "fd42::1/64"]);
        assert!(cfg.agents.characters_dir.is_absolute());
        assert_eq!(cfg.agents.reconcile_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_pull_flag_takes_explicit_value() {
        let args = Args::parse_from(["erebrus-gateway", "--pull-agent-image", "false"]);
        assert!(!args.pull_agent_image);
    }
}
