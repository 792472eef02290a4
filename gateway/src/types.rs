use serde::{Deserialize, Serialize};

// ============================================================================
// VPN Client Types
// ============================================================================

/// WireGuard peer record, one JSON file per client named by its UUID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default)]
    pub ignore_persistent_keepalive: bool,
    #[serde(default)]
    pub preshared_key: String,
    #[serde(default, rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub address: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_key: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub updated_by: String,
    /// Epoch millis
    #[serde(default)]
    pub created_at: i64,
    /// Epoch millis
    #[serde(default)]
    pub updated_at: i64,
    /// Filled from peer stats at read time, stored as zero.
    #[serde(default)]
    pub receive_bytes: u64,
    #[serde(default)]
    pub transmit_bytes: u64,
}

fn default_enable() -> bool {
    true
}

impl Default for Client {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            name: String::new(),
            tags: Vec::new(),
            email: String::new(),
            enable: true,
            ignore_persistent_keepalive: false,
            preshared_key: String::new(),
            allowed_ips: Vec::new(),
            address: Vec::new(),
            private_key: String::new(),
            public_key: String::new(),
            created_by: String::new(),
            updated_by: String::new(),
            created_at: 0,
            updated_at: 0,
            receive_bytes: 0,
            transmit_bytes: 0,
        }
    }
}

/// Public half of the server record handed to clients that build their own config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub public_key: String,
    pub endpoint: String,
    pub listen_port: u16,
    pub address: Vec<String>,
    pub dns: Vec<String>,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
    pub persistent_keepalive: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientResponse {
    pub client: Client,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListClientsResponse {
    pub clients: Vec<Client>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfigQuery {
    #[serde(default)]
    pub qrcode: bool,
}

// ============================================================================
// Reverse-Proxy Service Types
// ============================================================================

/// Reverse-proxy route entry as stored in `caddy.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub name: String,
    #[serde(rename = "type", default)]
    pub service_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    #[serde(with = "port_string")]
    pub port: u16,
    #[serde(default)]
    pub domain: String,
    /// Probed on demand, never persisted with a value.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// RFC 3339
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServicesList {
    #[serde(default)]
    pub services: Vec<ServiceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddServiceRequest {
    pub name: String,
    pub ip_address: String,
    #[serde(with = "port_string")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub service: ServiceRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// `caddy.json` has always carried ports as strings; accept numbers too.
pub mod port_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(port: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&port.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u16),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| de::Error::custom(format!("invalid port: {:?}", s))),
        }
    }
}

// ============================================================================
// Agent Types
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Inactive,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

/// Desired state of one containerized agent, stored in `agents.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub clients: Vec<String>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub avatar_img: String,
    #[serde(default)]
    pub cover_img: String,
    #[serde(default)]
    pub voice_model: String,
    #[serde(default)]
    pub organization: String,
    /// Uploaded file name under `characters/<name>/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Minimal shape every character definition must have.
#[derive(Debug, Clone, Deserialize)]
pub struct CharacterFile {
    #[serde(default)]
    pub name: String,
}

/// Agent identity as reported by the container's own `/agents` endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportedAgent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub clients: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportedAgents {
    #[serde(default)]
    pub agents: Vec<ReportedAgent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListAgentsResponse {
    pub agents: Vec<AgentRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent: AgentRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAgentResponse {
    pub agent: AgentRecord,
    pub domain: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManageAgentQuery {
    pub action: String,
}

// ============================================================================
// Authentication Challenge
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeQuery {
    #[serde(default)]
    pub wallet_address: String,
    #[serde(default)]
    pub chain_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    pub challenge_id: String,
    pub eula: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeStatusResponse {
    pub challenge_id: String,
    pub wallet_address: String,
    pub chain_name: String,
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_port_round_trips_as_string() {
        let json = r#"{"name":"web1","type":"nexus","ipAddress":"10.0.0.1","port":"8080","domain":"web1.example.com","createdAt":"2024-01-01T00:00:00Z"}"#;
        let svc: ServiceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(svc.port, 8080);

        let out = serde_json::to_value(&svc).unwrap();
        assert_eq!(out["port"], "8080");
        assert!(out.get("status").is_none());
    }

    #[test]
    fn test_add_service_request_accepts_numeric_port() {
        let req: AddServiceRequest =
            serde_json::from_str(r#"{"name":"web1","ipAddress":"10.0.0.1","port":8080}"#).unwrap();
        assert_eq!(req.port, 8080);

        let bad = serde_json::from_str::<AddServiceRequest>(
            r#"{"name":"web1","ipAddress":"10.0.0.1","port":"http"}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_agent_ledger_entry_without_new_fields() {
        let json = r#"{"id":"a1","name":"eliza","clients":[],"port":40123,"domain":"eliza.example.com","status":"inactive","avatar_img":"","cover_img":"","voice_model":"","organization":""}"#;
        let agent: AgentRecord = serde_json::from_str(json).unwrap();
        assert_eq!(agent.status, AgentStatus::Inactive);
        assert!(agent.character_file.is_none());
        assert!(agent.image.is_none());
    }

    #[test]
    fn test_client_defaults_enable() {
        let client: Client = serde_json::from_str(r#"{"name":"laptop"}"#).unwrap();
        assert!(client.enable);
        assert!(client.address.is_empty());
    }
}
