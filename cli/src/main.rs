mod config;
mod error;
mod http_client;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use config::{default_config_path, Config};
use http_client::{segment, Client};

const API_PREFIX: &str = "/api/v1.0";

#[derive(Parser, Debug)]
#[command(name = "erebrusctl")]
#[command(about = "Command line client for the Erebrus gateway", long_about = None)]
struct Cli {
    /// Gateway base URL (overrides the saved config)
    #[arg(long, env = "EREBRUS_URL", global = true)]
    url: Option<String>,

    /// Config file path
    #[arg(long, env = "EREBRUSCTL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30, global = true)]
    timeout_secs: u64,

    /// Retries for GET/DELETE on server errors
    #[arg(long, default_value_t = 2, global = true)]
    retries: u32,

    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show or change the saved gateway URL
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Check gateway health
    Health,
    /// Manage VPN clients
    #[command(subcommand)]
    Clients(ClientsCommand),
    /// Manage reverse-proxy routes
    #[command(subcommand)]
    Services(ServicesCommand),
    /// Manage hosted agents
    #[command(subcommand)]
    Agents(AgentsCommand),
    /// Request a wallet login challenge
    Challenge {
        #[arg(long)]
        wallet: String,
        #[arg(long)]
        chain: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Show,
    SetUrl { base_url: String },
}

#[derive(Subcommand, Debug)]
enum ClientsCommand {
    List,
    Get {
        id: String,
    },
    Create(ClientFields),
    /// Fetch the client, apply the given fields and send it back
    Update {
        id: String,
        #[command(flatten)]
        fields: ClientFields,
        #[arg(long)]
        enable: Option<bool>,
    },
    Delete {
        id: String,
    },
    /// Download the WireGuard config (or its QR code as SVG)
    Config {
        id: String,
        #[arg(long)]
        qrcode: bool,
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Default)]
struct ClientFields {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    email: Option<String>,
    /// Network (CIDR) to allocate from; repeatable
    #[arg(long = "address")]
    addresses: Vec<String>,
    #[arg(long = "allowed-ip")]
    allowed_ips: Vec<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Bring your own key instead of a generated pair
    #[arg(long)]
    public_key: Option<String>,
}

impl ClientFields {
    fn apply(self, body: &mut Value) {
        if let Some(name) = self.name {
            body["name"] = json!(name);
        }
        if let Some(email) = self.email {
            body["email"] = json!(email);
        }
        if !self.addresses.is_empty() {
            body["address"] = json!(self.addresses);
        }
        if !self.allowed_ips.is_empty() {
            body["allowedIPs"] = json!(self.allowed_ips);
        }
        if !self.tags.is_empty() {
            body["tags"] = json!(self.tags);
        }
        if let Some(key) = self.public_key {
            body["publicKey"] = json!(key);
        }
    }
}

#[derive(Subcommand, Debug)]
enum ServicesCommand {
    List,
    Get {
        name: String,
    },
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        ip: String,
        #[arg(long)]
        port: u16,
    },
    Delete {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum AgentsCommand {
    List,
    Get {
        id: String,
    },
    /// Upload a character file and start its container
    Create {
        #[arg(long)]
        character_file: PathBuf,
        #[arg(long, default_value = "")]
        avatar_img: String,
        #[arg(long, default_value = "")]
        cover_img: String,
        #[arg(long, default_value = "")]
        voice_model: String,
        #[arg(long, default_value = "")]
        organization: String,
        /// Container image override
        #[arg(long)]
        docker_url: Option<String>,
        /// Route domain override
        #[arg(long)]
        domain: Option<String>,
    },
    Delete {
        id: String,
    },
    Pause {
        id: String,
    },
    Resume {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut cfg = Config::load(&config_path)?;

    if let Command::Config(cmd) = &cli.command {
        match cmd {
            ConfigCommand::Show => {
                println!("config: {:?}", config_path);
                println!("base_url: {}", cfg.resolve_base_url(cli.url.as_deref()));
            }
            ConfigCommand::SetUrl { base_url } => {
                reqwest::Url::parse(base_url).context("Invalid URL")?;
                cfg.base_url = Some(base_url.clone());
                cfg.save(&config_path)?;
                println!("Saved base_url={} to {:?}", base_url, config_path);
            }
        }
        return Ok(());
    }

    let base_url = cfg.resolve_base_url(cli.url.as_deref());
    let client = Client::new(
        &base_url,
        Duration::from_secs(cli.timeout_secs),
        cli.retries,
    )?;

    match cli.command {
        Command::Config(_) => {}
        Command::Health => client.send_json(Method::GET, "/health", None).await?,
        Command::Clients(cmd) => run_clients(&client, cmd).await?,
        Command::Services(cmd) => run_services(&client, cmd).await?,
        Command::Agents(cmd) => run_agents(&client, cmd).await?,
        Command::Challenge { wallet, chain } => {
            let path = format!(
                "{}/authenticate?walletAddress={}&chainName={}",
                API_PREFIX,
                segment(&wallet),
                segment(&chain)
            );
            client.send_json(Method::GET, &path, None).await?
        }
    }

    Ok(())
}

async fn run_clients(client: &Client, cmd: ClientsCommand) -> Result<()> {
    match cmd {
        ClientsCommand::List => {
            client
                .send_json(Method::GET, &format!("{}/client", API_PREFIX), None)
                .await
        }
        ClientsCommand::Get { id } => {
            client
                .send_json(Method::GET, &client_path(&id), None)
                .await
        }
        ClientsCommand::Create(fields) => {
            let mut body = json!({});
            fields.apply(&mut body);
            client
                .send_json(Method::POST, &format!("{}/client", API_PREFIX), Some(body))
                .await
        }
        ClientsCommand::Update { id, fields, enable } => {
            let bytes = client
                .send_json_bytes(Method::GET, &client_path(&id), None)
                .await?;
            let current: Value =
                serde_json::from_slice(&bytes).context("Failed to parse client response")?;
            let mut body = current
                .get("client")
                .cloned()
                .context("Response has no client")?;

            fields.apply(&mut body);
            if let Some(enable) = enable {
                body["enable"] = json!(enable);
            }
            client
                .send_json(Method::PATCH, &client_path(&id), Some(body))
                .await
        }
        ClientsCommand::Delete { id } => {
            client
                .send_json(Method::DELETE, &client_path(&id), None)
                .await
        }
        ClientsCommand::Config { id, qrcode, output } => {
            let path = format!("{}/config?qrcode={}", client_path(&id), qrcode);
            match output {
                Some(out) => {
                    client.download_to_file(&path, &out).await?;
                    eprintln!("Wrote {:?}", out);
                    Ok(())
                }
                None => client.stream_to_stdout(&path).await,
            }
        }
    }
}

fn client_path(id: &str) -> String {
    format!("{}/client/{}", API_PREFIX, segment(id))
}

async fn run_services(client: &Client, cmd: ServicesCommand) -> Result<()> {
    match cmd {
        ServicesCommand::List => {
            client
                .send_json(Method::GET, &format!("{}/caddy", API_PREFIX), None)
                .await
        }
        ServicesCommand::Get { name } => {
            let path = format!("{}/caddy/{}", API_PREFIX, segment(&name));
            client.send_json(Method::GET, &path, None).await
        }
        ServicesCommand::Add { name, ip, port } => {
            let body = json!({
                "name": name,
                "ipAddress": ip,
                "port": port.to_string(),
            });
            client
                .send_json(Method::POST, &format!("{}/caddy", API_PREFIX), Some(body))
                .await
        }
        ServicesCommand::Delete { name } => {
            let path = format!("{}/caddy/{}", API_PREFIX, segment(&name));
            client.send_json(Method::DELETE, &path, None).await
        }
    }
}

async fn run_agents(client: &Client, cmd: AgentsCommand) -> Result<()> {
    match cmd {
        AgentsCommand::List => {
            client
                .send_json(Method::GET, &format!("{}/agents", API_PREFIX), None)
                .await
        }
        AgentsCommand::Get { id } => {
            let path = format!("{}/agents/{}", API_PREFIX, segment(&id));
            client.send_json(Method::GET, &path, None).await
        }
        AgentsCommand::Create {
            character_file,
            avatar_img,
            cover_img,
            voice_model,
            organization,
            docker_url,
            domain,
        } => {
            let contents = tokio::fs::read(&character_file)
                .await
                .with_context(|| format!("Failed to read {:?}", character_file))?;
            let file_name = character_file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("Character file path has no file name")?;

            let part = Part::bytes(contents)
                .file_name(file_name)
                .mime_str("application/json")?;
            let mut form = Form::new()
                .part("character_file", part)
                .text("avatar_img", avatar_img)
                .text("cover_img", cover_img)
                .text("voice_model", voice_model)
                .text("organization", organization);
            if let Some(url) = docker_url {
                form = form.text("docker_url", url);
            }
            if let Some(domain) = domain {
                form = form.text("domain", domain);
            }

            client
                .send_multipart(&format!("{}/agents", API_PREFIX), form)
                .await
        }
        AgentsCommand::Delete { id } => {
            let path = format!("{}/agents/{}", API_PREFIX, segment(&id));
            client.send_json(Method::DELETE, &path, None).await
        }
        AgentsCommand::Pause { id } => manage_agent(client, &id, "pause").await,
        AgentsCommand::Resume { id } => manage_agent(client, &id, "resume").await,
    }
}

async fn manage_agent(client: &Client, id: &str, action: &str) -> Result<()> {
    let path = format!(
        "{}/agents/manage/{}?action={}",
        API_PREFIX,
        segment(id),
        action
    );
    client.send_json(Method::PATCH, &path, None).await
}
