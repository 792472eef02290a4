use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

pub const SUPPORTED_CHAINS: &[&str] = &["ethereum", "peaq", "solana", "eclipse", "aptos", "sui"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub wallet_address: String,
    pub chain_name: String,
    issued_at: Instant,
}

/// Login challenges keyed by id, each valid for `ttl`.
pub struct ChallengeStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, Challenge>>,
}

impl ChallengeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Validate the wallet address for `chain_name` and issue a challenge id.
    pub fn issue(&self, wallet_address: &str, chain_name: &str) -> GatewayResult<String> {
        if wallet_address.is_empty() {
            return Err(GatewayError::invalid("Empty Wallet Address"));
        }
        if chain_name.is_empty() {
            return Err(GatewayError::invalid("Empty Chain Name"));
        }
        validate_address(chain_name, wallet_address)?;

        let id = Uuid::new_v4().to_string();
        let challenge = Challenge {
            wallet_address: wallet_address.to_string(),
            chain_name: chain_name.to_string(),
            issued_at: Instant::now(),
        };

        self.lock().insert(id.clone(), challenge);
        debug!(chain = chain_name, "Issued authentication challenge");
        Ok(id)
    }

    /// Live challenge for `id`. An expired entry is evicted and not returned.
    pub fn lookup(&self, id: &str) -> Option<Challenge> {
        let mut entries = self.lock();
        let challenge = entries.get(id)?;
        if challenge.issued_at.elapsed() < self.ttl {
            return Some(challenge.clone());
        }
        debug!(wallet = %challenge.wallet_address, chain = %challenge.chain_name, "Challenge expired");
        entries.remove(id);
        None
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, c| {
            let live = c.issued_at.elapsed() < ttl;
            if !live {
                debug!(wallet = %c.wallet_address, chain = %c.chain_name, "Challenge expired");
            }
            live
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Challenge>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Periodically evict expired challenges until `cancel` fires.
pub async fn challenge_sweeper(
    store: std::sync::Arc<ChallengeStore>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Challenge sweeper stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let removed = store.sweep();
        if removed > 0 {
            debug!(
                "Evicted {} expired challenge(s), {} outstanding",
                removed,
                store.len()
            );
        }
    }
}

pub fn validate_address(chain: &str, address: &str) -> GatewayResult<()> {
    let valid = match chain {
        "ethereum" | "sui" => is_prefixed_hex(address, 42),
        "aptos" => is_prefixed_hex(address, 66),
        "solana" | "eclipse" => (32..=44).contains(&address.len()) && is_base58(address),
        "peaq" => address.len() == 48 && address.starts_with('5') && is_base58(address),
        _ => {
            return Err(GatewayError::invalid(format!(
                "Invalid chain name {:?}; expected one of {}",
                chain,
                SUPPORTED_CHAINS.join(", ")
            )))
        }
    };

    if !valid {
        return Err(GatewayError::invalid(format!(
            "Invalid wallet address for {}",
            chain
        )));
    }
    Ok(())
}

fn is_prefixed_hex(address: &str, len: usize) -> bool {
    address.len() == len
        && address
            .strip_prefix("0x")
            .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_hexdigit()))
}

fn is_base58(address: &str) -> bool {
    address
        .chars()
        .all(|c| c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ETH: &str = "0x71C7656EC7ab88b098defB751B7401B5f6d8976F";

    #[test]
    fn test_addresses_per_chain() {
        assert!(validate_address("ethereum", ETH).is_ok());
        assert!(validate_address("ethereum", "0x123").is_err());
        assert!(validate_address("solana", "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM").is_ok());
        assert!(validate_address("solana", "0OIl0OIl0OIl0OIl0OIl0OIl0OIl0OIl").is_err());
        assert!(validate_address(
            "aptos",
            "0x0a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f9"
        )
        .is_ok());
        assert!(validate_address("bitcoin", ETH).is_err());
    }

    #[test]
    fn test_issue_and_lookup() {
        let store = ChallengeStore::new(Duration::from_secs(60));
        let id = store.issue(ETH, "ethereum").unwrap();

        let challenge = store.lookup(&id).unwrap();
        assert_eq!(challenge.wallet_address, ETH);
        assert_eq!(challenge.chain_name, "ethereum");
        assert_eq!(store.lookup(&id), Some(challenge));
        assert!(store.lookup("unknown").is_none());
    }

    #[test]
    fn test_expired_challenges_are_evicted() {
        let store = ChallengeStore::new(Duration::from_millis(20));
        let a = store.issue(ETH, "ethereum").unwrap();
        store.issue(ETH, "ethereum").unwrap();
        assert_eq!(store.len(), 2);

        std::thread::sleep(Duration::from_millis(40));
        assert!(store.lookup(&a).is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_empty_inputs() {
        let store = ChallengeStore::new(Duration::from_secs(60));
        assert!(matches!(store.issue("", "ethereum"), Err(GatewayError::Validation(_))));
        assert!(matches!(store.issue(ETH, ""), Err(GatewayError::Validation(_))));
        assert_eq!(store.len(), 0);
    }
}
