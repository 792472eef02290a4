use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;
use tempfile::TempDir;

/// Find a free TCP port by binding to port 0
pub fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to port 0");
    listener.local_addr().unwrap().port()
}

/// Wait for a TCP port to accept connections
pub async fn wait_for_port(port: u16, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for port {} to be ready", port);
        }
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Get the path to a compiled binary in the target directory
fn cargo_bin(name: &str) -> PathBuf {
    // Look for the binary in target/debug (standard cargo test location)
    let mut path = std::env::current_exe()
        .expect("Failed to get current exe")
        .parent()
        .expect("No parent")
        .parent()
        .expect("No grandparent")
        .to_path_buf();
    path.push(name);
    if path.exists() {
        return path;
    }

    // Fallback: try target/debug directly
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop(); // integration-tests -> workspace root
    path.push("target");
    path.push("debug");
    path.push(name);
    if path.exists() {
        return path;
    }

    panic!(
        "Binary '{}' not found. Run `cargo build --workspace` first.",
        name
    );
}

/// A gateway process whose state lives in a temp dir.
pub struct GatewayHarness {
    pub port: u16,
    process: Child,
    temp_dir: TempDir,
}

impl GatewayHarness {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let port = find_free_port();
        let process = spawn_gateway(temp_dir.path(), port);

        wait_for_port(port, Duration::from_secs(10)).await;

        Self {
            port,
            process,
            temp_dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn state_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn process_mut(&mut self) -> &mut Child {
        &mut self.process
    }

    /// Kill the gateway and start it again over the same state, on a new port
    pub async fn restart(&mut self) -> u16 {
        let _ = self.process.kill();
        let _ = self.process.wait();

        let port = find_free_port();
        self.process = spawn_gateway(self.temp_dir.path(), port);

        wait_for_port(port, Duration::from_secs(10)).await;

        self.port = port;
        port
    }
}

fn spawn_gateway(state: &Path, port: u16) -> Child {
    let path = |p: &str| state.join(p).to_string_lossy().to_string();

    Command::new(cargo_bin("erebrus-gateway"))
        .args(["--bind", &format!("127.0.0.1:{}", port)])
        .args(["--log-level", "debug"])
        .args(["--caddy-conf-dir", &path("caddy")])
        .args(["--service-conf-dir", &path("mirror")])
        .args(["--caddy-log-dir", &path("logs")])
        .args(["--service-domain", "node.test"])
        .args(["--wg-conf-dir", &path("wireguard")])
        .args(["--wg-clients-dir", &path("wireguard/clients")])
        .args(["--wg-address", "10.9.0.1/24"])
        .args(["--wg-endpoint-host", "vpn.node.test"])
        .args(["--agents-file", &path("agents.json")])
        .args(["--characters-dir", &path("characters")])
        .args(["--pull-agent-image", "false"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .expect("Failed to start gateway")
}

impl Drop for GatewayHarness {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

/// Response types for deserialization
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub uuid: String,
    pub name: String,
    pub address: Vec<String>,
    pub public_key: String,
    pub enable: bool,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub public_key: String,
    pub endpoint: String,
    pub listen_port: u16,
}

#[derive(Debug, serde::Deserialize)]
pub struct ClientResponse {
    pub client: Client,
    pub server: Option<ServerInfo>,
}

#[derive(Debug, serde::Deserialize)]
pub struct ListClientsResponse {
    pub clients: Vec<Client>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    pub ip_address: String,
    pub port: String,
    pub domain: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, serde::Deserialize)]
pub struct ServiceResponse {
    pub service: Service,
}

#[derive(Debug, serde::Deserialize)]
pub struct ServicesList {
    pub services: Vec<Service>,
}

#[derive(Debug, serde::Deserialize)]
pub struct ErrorResponse {
    pub error_code: String,
    #[serde(default)]
    pub details: Vec<String>,
}

pub fn client_spec(name: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "email": format!("{}@example.com", name),
        "address": ["10.9.0.0/24"],
    })
}
