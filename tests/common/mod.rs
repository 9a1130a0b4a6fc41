#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use swarmkeeper::bootstrap::{
    BootstrapCoordinator, BootstrapSettings, CredentialSource, JoinGrant, MembershipStore,
};
use swarmkeeper::command::{CommandOutput, CommandRunner};
use swarmkeeper::control_plane::{
    CleanupSummary, ControlPlane, LocalNodeState, LocalRuntime, StorageLayer, SwarmState,
};
use swarmkeeper::discovery::{Advertisement, Advertiser, DiscoveryStrategy, PeerDiscovery};
use swarmkeeper::error::{ClusterError, Result};
use swarmkeeper::identity::{IdentityResolver, LocalNetwork, NodeProbe, ResourceProbe};
use swarmkeeper::monitor::{AlertSink, HealthMonitor, MonitorSettings, Thresholds};
use swarmkeeper::reconcile::{DeploymentStore, ReconcileSettings, Reconciler};
use swarmkeeper::retry::RetryPolicy;
use swarmkeeper::types::{
    Alert, JoinRole, JoinToken, NodeRecord, NodeRole, NodeStatus, ResourceSample, ServiceSpec, TaskState,
    VolumeStatus,
};

pub fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

pub const LOCAL: u8 = 1;

pub fn node(id: &str, last: u8, healthy: bool) -> NodeRecord {
    NodeRecord {
        id: Some(id.to_string()),
        hostname: Some(format!("host-{}", id)),
        address: ip(last),
        role: NodeRole::Worker,
        last_seen_at: chrono::Utc::now(),
        healthy,
    }
}

fn unreachable() -> ClusterError {
    ClusterError::transient("Cannot connect to the Docker daemon")
}

/// Scriptable control plane that records every mutating call.
#[derive(Default)]
pub struct FakeControlPlane {
    /// `None` makes every query fail as unreachable
    pub local: Mutex<Option<LocalNodeState>>,
    /// Pings that fail before the control plane comes back
    pub ping_failures: AtomicUsize,
    pub nodes: Mutex<Option<Vec<NodeRecord>>>,
    pub services: Mutex<Option<Vec<String>>>,
    pub tasks: Mutex<HashMap<String, Vec<TaskState>>>,
    pub desired: Mutex<HashMap<String, u32>>,
    /// Managers whose join attempts fail with the given error
    pub join_errors: Mutex<HashMap<IpAddr, ClusterError>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeControlPlane {
    pub fn not_joined() -> Self {
        let fake = Self::default();
        fake.set_state(SwarmState::Inactive, false, None);
        fake.nodes.lock().unwrap().replace(Vec::new());
        fake.services.lock().unwrap().replace(Vec::new());
        fake
    }

    pub fn manager() -> Self {
        let fake = Self::not_joined();
        fake.set_state(SwarmState::Active, true, Some(ip(LOCAL)));
        fake
    }

    pub fn set_state(&self, state: SwarmState, is_manager: bool, manager: Option<IpAddr>) {
        *self.local.lock().unwrap() = Some(LocalNodeState {
            node_id: Some("local".into()),
            state,
            is_manager,
            manager_address: manager,
        });
    }

    pub fn go_down(&self) {
        *self.local.lock().unwrap() = None;
        *self.nodes.lock().unwrap() = None;
        *self.services.lock().unwrap() = None;
    }

    pub fn with_service(&self, name: &str, desired: u32, running: u32) {
        self.services.lock().unwrap().get_or_insert_with(Vec::new).push(name.to_string());
        self.desired.lock().unwrap().insert(name.to_string(), desired);
        let mut states = vec![TaskState::Running; running as usize];
        states.extend(std::iter::repeat(TaskState::Pending).take(desired.saturating_sub(running) as usize));
        self.tasks.lock().unwrap().insert(name.to_string(), states);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn reachable(&self) -> Result<LocalNodeState> {
        self.local.lock().unwrap().clone().ok_or_else(unreachable)
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn ping(&self) -> Result<()> {
        let pending = self.ping_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.ping_failures.store(pending - 1, Ordering::SeqCst);
            return Err(unreachable());
        }
        self.reachable().map(|_| ())
    }

    async fn local_state(&self) -> Result<LocalNodeState> {
        self.reachable()
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        self.nodes
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ClusterError::control_plane("node listing failed"))
    }

    async fn inspect_node(&self, id: &str) -> Result<NodeStatus> {
        let nodes = self.list_nodes().await?;
        let node = nodes
            .iter()
            .find(|n| n.id.as_deref() == Some(id))
            .ok_or_else(|| ClusterError::control_plane(format!("no such node {}", id)))?;
        Ok(NodeStatus {
            state: if node.healthy { "ready".into() } else { "down".into() },
            message: (!node.healthy).then(|| "heartbeat failure".to_string()),
        })
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        self.services
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ClusterError::control_plane("service listing failed"))
    }

    async fn list_tasks(&self, service: &str) -> Result<Vec<TaskState>> {
        self.reachable()?;
        Ok(self.tasks.lock().unwrap().get(service).cloned().unwrap_or_default())
    }

    async fn inspect_service(&self, service: &str) -> Result<Option<u32>> {
        Ok(self.desired.lock().unwrap().get(service).copied())
    }

    async fn init_cluster(&self, address: IpAddr) -> Result<JoinToken> {
        self.record(format!("init {}", address));
        self.set_state(SwarmState::Active, true, Some(address));
        Ok(JoinToken::new("SWMTKN-1-manager"))
    }

    async fn join_cluster(&self, manager: IpAddr, token: &JoinToken) -> Result<()> {
        self.record(format!("join {}", manager));
        if let Some(e) = self.join_errors.lock().unwrap().get(&manager) {
            return Err(e.clone());
        }
        assert!(!token.is_empty());
        self.set_state(SwarmState::Active, false, Some(manager));
        Ok(())
    }

    async fn issue_join_token(&self, role: JoinRole) -> Result<JoinToken> {
        self.record(format!("token {}", role));
        let local = self.reachable()?;
        if !local.is_manager {
            return Err(ClusterError::control_plane("This node is not a swarm manager"));
        }
        Ok(JoinToken::new(format!("SWMTKN-1-{}", role)))
    }

    async fn force_service_update(&self, service: &str) -> Result<()> {
        self.record(format!("force_update {}", service));
        Ok(())
    }

    async fn create_overlay_network(&self, name: &str) -> Result<()> {
        self.record(format!("network {}", name));
        Ok(())
    }

    async fn limit_service_memory(&self, service: &str, limit: &str) -> Result<()> {
        self.record(format!("limit {} {}", service, limit));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    pub restarts: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub exited: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    /// Control plane brought back by a restart
    pub revives: Mutex<Option<Arc<FakeControlPlane>>>,
    /// Resource probe whose pressure a cleanup relieves
    pub relieves: Mutex<Option<Arc<FakeResources>>>,
}

#[async_trait]
impl LocalRuntime for FakeRuntime {
    async fn restart_agent(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if let Some(cp) = self.revives.lock().unwrap().as_ref() {
            cp.set_state(SwarmState::Active, true, Some(ip(LOCAL)));
        }
        Ok(())
    }

    async fn run_cleanup(&self) -> Result<CleanupSummary> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if let Some(resources) = self.relieves.lock().unwrap().as_ref() {
            resources.set(Some(40.0), Some(50.0));
        }
        Ok(CleanupSummary {
            commands_run: 3,
            commands_failed: 0,
        })
    }

    async fn list_exited_managed(&self) -> Result<Vec<String>> {
        Ok(self.exited.lock().unwrap().clone())
    }

    async fn remove_unit(&self, id: &str) -> Result<()> {
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

pub struct FixedIdentity(pub IpAddr);

#[async_trait]
impl IdentityResolver for FixedIdentity {
    async fn local_network(&self) -> Result<LocalNetwork> {
        Ok(LocalNetwork {
            address: self.0,
            prefix: 24,
        })
    }

    async fn hostname(&self) -> Option<String> {
        Some("node-under-test".into())
    }
}

pub struct FakeResources {
    current: Mutex<(Option<f64>, Option<f64>)>,
}

impl FakeResources {
    pub fn new(memory: Option<f64>, disk: Option<f64>) -> Self {
        Self {
            current: Mutex::new((memory, disk)),
        }
    }

    pub fn set(&self, memory: Option<f64>, disk: Option<f64>) {
        *self.current.lock().unwrap() = (memory, disk);
    }
}

#[async_trait]
impl ResourceProbe for FakeResources {
    async fn sample(&self) -> ResourceSample {
        let (memory, disk) = *self.current.lock().unwrap();
        ResourceSample::new(memory, disk, Some(10.0))
    }
}

/// Hands out scripted answers per peer and records the order of requests.
#[derive(Default)]
pub struct FakeCredentials {
    pub outcomes: Mutex<HashMap<IpAddr, std::result::Result<JoinGrant, ClusterError>>>,
    pub requested: Mutex<Vec<IpAddr>>,
}

impl FakeCredentials {
    pub fn grant(&self, peer: IpAddr) {
        self.outcomes.lock().unwrap().insert(
            peer,
            Ok(JoinGrant {
                token: JoinToken::new("SWMTKN-1-worker"),
                manager_address: peer,
                role: JoinRole::Worker,
            }),
        );
    }

    pub fn fail(&self, peer: IpAddr, error: ClusterError) {
        self.outcomes.lock().unwrap().insert(peer, Err(error));
    }

    pub fn requested(&self) -> Vec<IpAddr> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialSource for FakeCredentials {
    async fn request_token(&self, peer: IpAddr, _role: JoinRole) -> Result<JoinGrant> {
        self.requested.lock().unwrap().push(peer);
        self.outcomes
            .lock()
            .unwrap()
            .get(&peer)
            .cloned()
            .unwrap_or_else(|| Err(ClusterError::transient(format!("{} unreachable", peer))))
    }
}

#[derive(Default)]
pub struct FakeStrategy {
    pub peers: Mutex<BTreeSet<IpAddr>>,
    pub passes: AtomicUsize,
}

impl FakeStrategy {
    pub fn set(&self, peers: &[IpAddr]) {
        *self.peers.lock().unwrap() = peers.iter().copied().collect();
    }
}

#[async_trait]
impl DiscoveryStrategy for FakeStrategy {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn discover(&self) -> Result<BTreeSet<IpAddr>> {
        self.passes.fetch_add(1, Ordering::SeqCst);
        Ok(self.peers.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct RecordingAdvertiser {
    pub published: Mutex<Vec<Advertisement>>,
}

#[async_trait]
impl Advertiser for RecordingAdvertiser {
    async fn publish(&self, ad: &Advertisement) -> Result<()> {
        self.published.lock().unwrap().push(ad.clone());
        Ok(())
    }

    async fn withdraw(&self) -> Result<()> {
        Ok(())
    }
}

pub struct FakeStorage {
    pub status: Mutex<std::result::Result<VolumeStatus, ClusterError>>,
    pub calls: Mutex<Vec<String>>,
}

impl Default for FakeStorage {
    fn default() -> Self {
        Self {
            status: Mutex::new(Ok(VolumeStatus::Online)),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StorageLayer for FakeStorage {
    async fn volume_status(&self, _name: &str) -> Result<VolumeStatus> {
        self.status.lock().unwrap().clone()
    }

    async fn create_volume(&self, name: &str, bricks: &[String]) -> Result<()> {
        self.calls.lock().unwrap().push(format!("create {} {}", name, bricks.join(",")));
        Ok(())
    }

    async fn mount(&self, name: &str, path: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(format!("mount {} {}", name, path.display()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub batches: Mutex<VecDeque<Vec<Alert>>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn emit(&self, _hostname: &str, alerts: &[Alert]) -> Result<()> {
        self.batches.lock().unwrap().push_back(alerts.to_vec());
        Ok(())
    }
}

/// A host where no external tool is installed.
#[derive(Default)]
pub struct MissingTools {
    pub attempts: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandRunner for MissingTools {
    async fn run(&self, program: &str, _args: &[&str]) -> Result<CommandOutput> {
        self.attempts.lock().unwrap().push(program.to_string());
        Err(ClusterError::precondition(format!("required tool `{}` is not installed", program)))
    }
}

/// A node wired entirely from fakes, with its state in a temp directory.
pub struct Harness {
    pub dir: TempDir,
    pub control_plane: Arc<FakeControlPlane>,
    pub runtime: Arc<FakeRuntime>,
    pub resources: Arc<FakeResources>,
    pub credentials: Arc<FakeCredentials>,
    pub strategy: Arc<FakeStrategy>,
    pub advertiser: Arc<RecordingAdvertiser>,
    pub storage: Arc<FakeStorage>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new(control_plane: FakeControlPlane) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            control_plane: Arc::new(control_plane),
            runtime: Arc::new(FakeRuntime::default()),
            resources: Arc::new(FakeResources::new(Some(40.0), Some(50.0))),
            credentials: Arc::new(FakeCredentials::default()),
            strategy: Arc::new(FakeStrategy::default()),
            advertiser: Arc::new(RecordingAdvertiser::default()),
            storage: Arc::new(FakeStorage::default()),
            sink: Arc::new(RecordingSink::default()),
        }
    }

    pub fn store(&self) -> MembershipStore {
        MembershipStore::new(self.dir.path().join("membership.json"))
    }

    pub fn probe(&self) -> NodeProbe {
        NodeProbe::new(
            Arc::new(FixedIdentity(ip(LOCAL))),
            self.resources.clone(),
            self.control_plane.clone(),
        )
    }

    pub fn coordinator(&self) -> BootstrapCoordinator {
        BootstrapCoordinator::new(
            self.probe(),
            PeerDiscovery::new(vec![self.strategy.clone() as Arc<dyn DiscoveryStrategy>]),
            self.credentials.clone(),
            self.control_plane.clone(),
            Some(self.storage.clone()),
            self.advertiser.clone(),
            self.store(),
            BootstrapSettings {
                join_role: JoinRole::Worker,
                overlay_networks: vec!["public".into(), "internal".into()],
                storage: None,
                service_port: 9440,
                descriptor_version: "v1".into(),
            },
        )
    }

    pub fn reconciler(&self, services: Vec<ServiceSpec>) -> Reconciler {
        self.reconciler_with(self.control_plane.clone(), self.runtime.clone(), services)
    }

    pub fn reconciler_with(
        &self,
        control_plane: Arc<dyn ControlPlane>,
        runtime: Arc<dyn LocalRuntime>,
        services: Vec<ServiceSpec>,
    ) -> Reconciler {
        Reconciler::new(
            control_plane,
            runtime,
            self.probe(),
            self.coordinator(),
            DeploymentStore::new(self.dir.path().join("deployment.json")),
            ReconcileSettings {
                services,
                remediation: RetryPolicy::exponential(2, Duration::ZERO, Duration::ZERO, 1.0),
                high_water_percent: 90.0,
                shed_service: Some("batch".into()),
                shed_memory_limit: "256M".into(),
                descriptor_version: "v1".into(),
            },
        )
    }

    pub fn monitor(&self, services: Vec<ServiceSpec>, storage_volume: Option<&str>) -> HealthMonitor {
        self.monitor_with(self.control_plane.clone(), services, storage_volume)
    }

    pub fn monitor_with(
        &self,
        control_plane: Arc<dyn ControlPlane>,
        services: Vec<ServiceSpec>,
        storage_volume: Option<&str>,
    ) -> HealthMonitor {
        HealthMonitor::new(
            control_plane,
            Some(self.storage.clone()),
            self.probe(),
            vec![self.sink.clone() as Arc<dyn AlertSink>],
            MonitorSettings {
                thresholds: Thresholds::default(),
                services,
                storage_volume: storage_volume.map(String::from),
                report_path: Some(self.dir.path().join("health-report.json")),
                departure_timeout: Duration::from_secs(3600),
            },
        )
    }
}
