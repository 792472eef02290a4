use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::services::agent_ledger::AgentLedger;
use crate::services::container_runtime::ContainerRuntime;
use crate::types::{AgentRecord, AgentStatus};

/// What one pass over the ledger did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub healthy: usize,
    pub restarted: usize,
    pub recreated: usize,
    pub failed: usize,
}

/// Background task keeping agent containers converged with the ledger until
/// `cancel` fires.
pub async fn fleet_reconciler(
    ledger: AgentLedger,
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Starting fleet reconciler (interval {:?})", interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Fleet reconciler stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let report = reconcile_once(&ledger, runtime.as_ref()).await;
        if report.restarted + report.recreated + report.failed > 0 {
            info!(
                healthy = report.healthy,
                restarted = report.restarted,
                recreated = report.recreated,
                failed = report.failed,
                "Reconciliation pass finished"
            );
        }
    }
}

/// Probe every agent once and repair drift. The ledger is only read.
///
/// Each agent is handled under the fleet lock and re-read from the ledger
/// first, so an agent deleted since the pass started is never recreated.
pub async fn reconcile_once(ledger: &AgentLedger, runtime: &dyn ContainerRuntime) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    let agents = match ledger.list().await {
        Ok(agents) => agents,
        Err(e) => {
            error!("Failed to load agent ledger for reconciliation: {}", e);
            return report;
        }
    };

    for listed in &agents {
        let _fleet = ledger.lock_fleet().await;
        let current = match ledger.find(&listed.id).await {
            Ok(Some(agent)) => agent,
            Ok(None) => {
                debug!(agent = %listed.name, "Agent left the ledger, skipping");
                continue;
            }
            Err(e) => {
                error!(agent = %listed.name, "Failed to re-read agent ledger: {}", e);
                report.failed += 1;
                continue;
            }
        };
        let agent = &current;

        match runtime.is_running(&agent.name).await {
            Ok(true) => report.healthy += 1,
            Ok(false) => {
                warn!(agent = %agent.name, "Agent container is not running, restarting");
                match runtime.restart(&agent.name).await {
                    Ok(()) => {
                        enforce_status(runtime, agent).await;
                        info!(agent = %agent.name, "Agent restored");
                        report.restarted += 1;
                    }
                    Err(e) => {
                        warn!(agent = %agent.name, "Restart failed, recreating: {:#}", e);
                        tally(&mut report, recreate(ledger, runtime, agent).await);
                    }
                }
            }
            Err(e) => {
                warn!(agent = %agent.name, "Agent container inspection failed, recreating: {:#}", e);
                tally(&mut report, recreate(ledger, runtime, agent).await);
            }
        }
    }

    report
}

fn tally(report: &mut ReconcileReport, recreated: bool) {
    if recreated {
        report.recreated += 1;
    } else {
        report.failed += 1;
    }
}

async fn recreate(ledger: &AgentLedger, runtime: &dyn ContainerRuntime, agent: &AgentRecord) -> bool {
    let Some(spec) = ledger.container_spec(agent) else {
        error!(agent = %agent.name, "Cannot recreate agent: no image recorded or configured");
        return false;
    };

    // Either may fail when the container is already gone.
    if let Err(e) = runtime.stop(&agent.name).await {
        debug!(agent = %agent.name, "stop before recreate: {:#}", e);
    }
    if let Err(e) = runtime.remove(&agent.name).await {
        debug!(agent = %agent.name, "rm before recreate: {:#}", e);
    }

    if let Err(e) = runtime.run(&spec).await {
        error!(agent = %agent.name, "Failed to recreate agent: {:#}", e);
        return false;
    }

    enforce_status(runtime, agent).await;
    info!(agent = %agent.name, port = agent.port, "Agent container recreated");
    true
}

// A repaired container comes back running; paused agents must stay paused.
async fn enforce_status(runtime: &dyn ContainerRuntime, agent: &AgentRecord) {
    if agent.status == AgentStatus::Inactive {
        if let Err(e) = runtime.pause(&agent.name).await {
            error!(agent = %agent.name, "Failed to re-pause agent: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, ProxyConfig};
    use crate::services::agent_api::fake::FakeEndpoint;
    use crate::services::container_runtime::fake::{FakeRuntime, FakeState};
    use crate::services::container_runtime::ContainerSpec;
    use crate::services::service_registry::ServiceRegistry;
    use crate::store;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Holds the first inspection open until the test releases it.
    struct GatedRuntime {
        inner: FakeRuntime,
        gated: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl GatedRuntime {
        fn new(inner: FakeRuntime) -> Self {
            Self {
                inner,
                gated: AtomicBool::new(true),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for GatedRuntime {
        async fn pull(&self, image: &str) -> Result<()> {
            self.inner.pull(image).await
        }
        async fn run(&self, spec: &ContainerSpec) -> Result<()> {
            self.inner.run(spec).await
        }
        async fn stop(&self, name: &str) -> Result<()> {
            self.inner.stop(name).await
        }
        async fn remove(&self, name: &str) -> Result<()> {
            self.inner.remove(name).await
        }
        async fn pause(&self, name: &str) -> Result<()> {
            self.inner.pause(name).await
        }
        async fn unpause(&self, name: &str) -> Result<()> {
            self.inner.unpause(name).await
        }
        async fn restart(&self, name: &str) -> Result<()> {
            self.inner.restart(name).await
        }
        async fn is_running(&self, name: &str) -> Result<bool> {
            if self.gated.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.is_running(name).await
        }
    }

    fn record(name: &str, port: u16, status: AgentStatus) -> AgentRecord {
        AgentRecord {
            id: format!("{}-id", name),
            name: name.to_string(),
            port,
            domain: format!("{}.agents.example.com", name),
            status,
            character_file: Some(format!("{}.character.json", name)),
            ..Default::default()
        }
    }

    fn setup(agents: &[AgentRecord]) -> (TempDir, AgentLedger, FakeRuntime) {
        let dir = TempDir::new().unwrap();
        let cfg = AgentConfig {
            ledger_file: dir.path().join("agents.json"),
            characters_dir: PathBuf::from("/srv/characters"),
            image: Some("agent:latest".to_string()),
            pull_image: false,
            domain: "agents.example.com".to_string(),
            readiness_timeout: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(15),
        };
        store::write_json(&cfg.ledger_file, &agents).unwrap();

        let proxy = ProxyConfig {
            registry_file: dir.path().join("caddy.json"),
            mirror_file: dir.path().join("mirror.json"),
            site_file: dir.path().join("erebrus.caddy"),
            log_dir: "/var/log/caddy".to_string(),
            tls_email: "ops@example.com".to_string(),
            node_type: "nexus".to_string(),
            service_domain: "example.com".to_string(),
            probe_host: "127.0.0.1".to_string(),
        };
        let runtime = FakeRuntime::new();
        let ledger = AgentLedger::new(
            cfg,
            Arc::new(runtime.clone()),
            Arc::new(FakeEndpoint::default()),
            ServiceRegistry::new(&proxy),
            CancellationToken::new(),
        );
        (dir, ledger, runtime)
    }

    fn spec(name: &str, port: u16) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "agent:latest".to_string(),
            host_port: port,
            characters_dir: PathBuf::from("/srv/characters"),
            character_file: format!("{}.character.json", name),
        }
    }

    #[tokio::test]
    async fn test_inactive_stopped_agent_ends_paused() {
        let (_dir, ledger, runtime) = setup(&[record("eliza", 40001, AgentStatus::Inactive)]);
        runtime.insert(spec("eliza", 40001), FakeState::Exited);

        let report = reconcile_once(&ledger, &runtime).await;

        assert_eq!(report.restarted, 1);
        assert_eq!(runtime.state("eliza"), Some(FakeState::Paused));
    }

    #[tokio::test]
    async fn test_missing_container_is_recreated_with_same_mapping() {
        let (_dir, ledger, runtime) = setup(&[record("eliza", 40001, AgentStatus::Active)]);

        let report = reconcile_once(&ledger, &runtime).await;

        assert_eq!(report.recreated, 1);
        assert_eq!(runtime.state("eliza"), Some(FakeState::Running));
        assert_eq!(runtime.spec("eliza").unwrap(), spec("eliza", 40001));
    }

    #[tokio::test]
    async fn test_failed_restart_falls_back_to_recreate_and_repauses() {
        let (_dir, ledger, runtime) = setup(&[record("eliza", 40001, AgentStatus::Inactive)]);
        runtime.insert(spec("eliza", 40001), FakeState::Exited);
        runtime.set(|s| s.fail_restart = true);

        let report = reconcile_once(&ledger, &runtime).await;

        assert_eq!(report.recreated, 1);
        assert_eq!(runtime.state("eliza"), Some(FakeState::Paused));
        let calls = runtime.calls();
        assert!(calls.contains(&"restart eliza".to_string()));
        assert!(calls.contains(&"run eliza".to_string()));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_skip_the_rest() {
        let (_dir, ledger, runtime) = setup(&[
            record("alpha", 40001, AgentStatus::Active),
            record("bravo", 40002, AgentStatus::Active),
        ]);
        runtime.insert(spec("bravo", 40002), FakeState::Exited);
        runtime.set(|s| s.fail_run = true);

        let report = reconcile_once(&ledger, &runtime).await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.restarted, 1);
        assert_eq!(runtime.state("bravo"), Some(FakeState::Running));
    }

    #[tokio::test]
    async fn test_healthy_and_paused_agents_are_left_alone() {
        let (_dir, ledger, runtime) = setup(&[
            record("alpha", 40001, AgentStatus::Active),
            record("bravo", 40002, AgentStatus::Inactive),
        ]);
        runtime.insert(spec("alpha", 40001), FakeState::Running);
        runtime.insert(spec("bravo", 40002), FakeState::Paused);

        let report = reconcile_once(&ledger, &runtime).await;

        assert_eq!(report.healthy, 2);
        assert_eq!(runtime.calls(), vec!["inspect alpha", "inspect bravo"]);
    }

    #[tokio::test]
    async fn test_delete_waits_for_inflight_repair_and_is_not_undone() {
        let (_dir, ledger, fake) = setup(&[record("eliza", 40001, AgentStatus::Active)]);
        fake.insert(spec("eliza", 40001), FakeState::Running);
        let runtime = Arc::new(GatedRuntime::new(fake.clone()));

        let pass = tokio::spawn({
            let ledger = ledger.clone();
            let runtime = runtime.clone();
            async move { reconcile_once(&ledger, runtime.as_ref()).await }
        });
        runtime.entered.notified().await;

        let delete = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.delete_agent("eliza-id").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!delete.is_finished());
        runtime.release.notify_one();

        let report = pass.await.unwrap();
        delete.await.unwrap().unwrap();

        assert_eq!(report.recreated, 0);
        assert_eq!(fake.state("eliza"), None);
        assert!(ledger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_agent_removed_mid_pass_is_skipped() {
        let (dir, ledger, runtime) = setup(&[record("eliza", 40001, AgentStatus::Active)]);

        let fleet = ledger.lock_fleet().await;
        let pass = tokio::spawn({
            let ledger = ledger.clone();
            let runtime = runtime.clone();
            async move { reconcile_once(&ledger, &runtime).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        store::write_json(&dir.path().join("agents.json"), &Vec::<AgentRecord>::new()).unwrap();
        drop(fleet);

        let report = pass.await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(runtime.state("eliza"), None);
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let (_dir, ledger, runtime) = setup(&[]);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(fleet_reconciler(
            ledger,
            Arc::new(runtime),
            Duration::from_millis(10),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
