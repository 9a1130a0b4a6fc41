use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::Commands;
use crate::api::{self, ApiState};
use crate::bootstrap::{BootstrapCoordinator, BootstrapSettings, HttpCredentialSource, MembershipStore};
use crate::command::{CommandRunner, SystemCommandRunner};
use crate::config::Config;
use crate::control_plane::{ControlPlane, DockerCli, GlusterCli, LocalRuntime, StorageLayer};
use crate::discovery::{
    ActiveProbe, Advertiser, DiscoveryStrategy, MdnsAdvertiser, MdnsBrowser, NoopAdvertiser, PeerDiscovery,
    StaticPeers, SystemProber,
};
use crate::error::Result;
use crate::identity::{IdentityResolver, NodeProbe, SystemIdentity, SystemResourceProbe};
use crate::monitor::{AlertSink, HealthMonitor, HealthReport, LogAlertSink, MonitorSettings, WebhookAlertSink};
use crate::reconcile::{DeploymentStore, ReconcileSettings, Reconciler};

/// Wires the components from configuration and runs CLI commands.
pub struct CliHandler {
    config: Config,
    control_plane: Arc<dyn ControlPlane>,
    advertiser: Arc<dyn Advertiser>,
    probe: NodeProbe,
    discovery: PeerDiscovery,
    store: MembershipStore,
    bootstrap: BootstrapCoordinator,
    reconciler: Reconciler,
    monitor: Arc<HealthMonitor>,
}

impl CliHandler {
    pub fn new(config: Config) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new(config.command_timeout()));
        let commands = &config.commands;

        let docker = Arc::new(
            DockerCli::new(runner.clone())
                .with_binaries(&commands.docker, &commands.systemctl)
                .with_agent_unit(&commands.agent_unit)
                .with_cleanup_commands(config.reconcile.cleanup_commands.clone())
                .with_managed_label(&config.reconcile.managed_label),
        );
        let control_plane: Arc<dyn ControlPlane> = docker.clone();
        let runtime: Arc<dyn LocalRuntime> = docker;

        let storage: Option<Arc<dyn StorageLayer>> =
            if config.bootstrap.storage.is_some() || config.monitor.storage_volume.is_some() {
                Some(Arc::new(
                    GlusterCli::new(runner.clone()).with_binaries(&commands.gluster, &commands.mount),
                ))
            } else {
                None
            };

        let identity: Arc<dyn IdentityResolver> = Arc::new(SystemIdentity::new(config.node.advertise_address));
        let probe = NodeProbe::new(
            identity.clone(),
            Arc::new(SystemResourceProbe::new(&config.node.state_dir)),
            control_plane.clone(),
        );

        let discovery = PeerDiscovery::new(Self::strategies(&config, identity, runner));

        let advertiser: Arc<dyn Advertiser> = if config.discovery.mdns_enabled {
            Arc::new(MdnsAdvertiser::new(&config.discovery.mdns_service_type))
        } else {
            Arc::new(NoopAdvertiser)
        };

        let credentials = Arc::new(HttpCredentialSource::new(
            config.node.service_port,
            Duration::from_secs(config.bootstrap.token_timeout_secs),
        )?);

        let store = MembershipStore::new(config.membership_path());
        let bootstrap = BootstrapCoordinator::new(
            probe.clone(),
            discovery.clone(),
            credentials,
            control_plane.clone(),
            storage.clone(),
            advertiser.clone(),
            store.clone(),
            BootstrapSettings::from_config(&config),
        );

        let reconciler = Reconciler::new(
            control_plane.clone(),
            runtime,
            probe.clone(),
            bootstrap.clone(),
            DeploymentStore::new(config.deployment_path()),
            ReconcileSettings::from_config(&config),
        );

        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];
        if let Some(url) = &config.monitor.webhook_url {
            sinks.push(Arc::new(WebhookAlertSink::new(
                url,
                Duration::from_secs(config.monitor.webhook_timeout_secs),
            )?));
        }
        let monitor = Arc::new(HealthMonitor::new(
            control_plane.clone(),
            storage,
            probe.clone(),
            sinks,
            MonitorSettings::from_config(&config),
        ));

        Ok(Self {
            config,
            control_plane,
            advertiser,
            probe,
            discovery,
            store,
            bootstrap,
            reconciler,
            monitor,
        })
    }

    fn strategies(
        config: &Config,
        identity: Arc<dyn IdentityResolver>,
        runner: Arc<dyn CommandRunner>,
    ) -> Vec<Arc<dyn DiscoveryStrategy>> {
        let discovery = &config.discovery;
        let mut strategies: Vec<Arc<dyn DiscoveryStrategy>> = Vec::new();
        if discovery.active_enabled {
            let prober = Arc::new(SystemProber::new(runner, &config.commands.ping));
            strategies.push(Arc::new(
                ActiveProbe::new(identity, prober, config.node.service_port)
                    .with_timeouts(
                        Duration::from_millis(discovery.reach_timeout_ms),
                        Duration::from_millis(discovery.port_timeout_ms),
                    )
                    .with_concurrency(discovery.concurrency)
                    .with_min_prefix(discovery.min_prefix),
            ));
        }
        if discovery.mdns_enabled {
            strategies.push(Arc::new(MdnsBrowser::new(
                &discovery.mdns_service_type,
                Duration::from_millis(discovery.mdns_browse_ms),
            )));
        }
        if !discovery.static_peers.is_empty() {
            strategies.push(Arc::new(StaticPeers::new(discovery.static_peers.iter().copied())));
        }
        strategies
    }

    pub async fn execute(&self, command: &Commands, stop: watch::Receiver<bool>) -> Result<()> {
        match command {
            Commands::Discover => self.discover().await,
            Commands::Bootstrap => self.bootstrap().await,
            Commands::Reconcile { daemon: false } => {
                let report = self.reconciler.run_cycle().await;
                println!("{}", serde_json::to_string_pretty(&report)?);
                report.fatal.map_or(Ok(()), Err)
            }
            Commands::Reconcile { daemon: true } => self.reconcile_loop(stop).await.map(|_| ()),
            Commands::Monitor { daemon: false } => {
                let report = self.monitor.run_cycle().await;
                println!("{}", report.to_json()?);
                report.fatal.map_or(Ok(()), Err)
            }
            Commands::Monitor { daemon: true } => self.monitor_loop(stop).await.map(|_| ()),
            Commands::Agent => self.agent(stop).await,
            Commands::Status => self.status(),
            Commands::Reset => {
                self.store.reset()?;
                println!("Membership reset to not_joined ({:?})", self.store.path());
                Ok(())
            }
        }
    }

    async fn discover(&self) -> Result<()> {
        let local = self.probe.local_address().await?;
        let peers = self.discovery.discover(local).await;
        println!("Local address: {}", local);
        if peers.is_empty() {
            println!("No peers found");
        }
        for peer in peers {
            println!("{}", peer);
        }
        Ok(())
    }

    async fn bootstrap(&self) -> Result<()> {
        let report = self.bootstrap.run().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }

    async fn reconcile_loop(&self, stop: watch::Receiver<bool>) -> Result<u64> {
        let interval = Duration::from_secs(self.config.reconcile.interval_secs);
        self.reconciler
            .run_loop(interval, self.config.reconcile_budget(), stop)
            .await
    }

    async fn monitor_loop(&self, stop: watch::Receiver<bool>) -> Result<u64> {
        let interval = Duration::from_secs(self.config.monitor.interval_secs);
        self.monitor.run_loop(interval, self.config.monitor_budget(), stop).await
    }

    async fn agent(&self, stop: watch::Receiver<bool>) -> Result<()> {
        let local = self.probe.local_address().await?;
        let state = ApiState {
            control_plane: self.control_plane.clone(),
            store: self.store.clone(),
            report_path: self.config.monitor.report_path.clone(),
            advertise_address: Some(local),
            allow_manager_join: self.config.node.allow_manager_join,
        };
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.node.service_port);
        let server = tokio::spawn(api::serve(addr, state, stop.clone()));

        let policy = self.config.bootstrap.retry.to_policy();
        match self.bootstrap.run_until_settled(&policy).await {
            Ok(report) => info!("Bootstrap settled: {:?}", report.outcome),
            Err(e) if e.is_fatal() => {
                error!("Bootstrap failed fatally: {}", e);
                return Err(e);
            }
            // The reconcile loop re-invokes bootstrap while membership is missing
            Err(e) => warn!("Bootstrap not settled, continuing: {}", e),
        }

        // A fatal error in either loop cancels the other one
        let loops = tokio::try_join!(self.reconcile_loop(stop.clone()), self.monitor_loop(stop));

        if let Err(e) = self.advertiser.withdraw().await {
            warn!("Failed to withdraw advertisement: {}", e);
        }
        if let Err(e) = loops {
            server.abort();
            return Err(e);
        }
        match server.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => {
                error!("Token service task failed: {}", e);
                Ok(())
            }
        }
    }

    fn status(&self) -> Result<()> {
        let membership = self.store.load()?;
        println!("Membership:     {}", membership.state);
        if let Some(manager) = membership.manager_address {
            println!("Manager:        {}", manager);
        }
        if let Some(joined_at) = membership.joined_at {
            println!("Joined at:      {}", joined_at);
        }
        if let Some(version) = &membership.last_applied_version {
            println!("Applied:        {}", version);
        }

        match HealthReport::read_from(&self.config.monitor.report_path) {
            Ok(report) => {
                let count = |n: Option<usize>| n.map_or("unavailable".to_string(), |n| n.to_string());
                println!("Report at:      {}", report.generated_at);
                println!("Nodes:          {}", count(report.node_count()));
                println!("Services:       {}", count(report.service_count()));
                println!("Alerts:         {}", report.alerts.len());
                for alert in &report.alerts {
                    println!("  [{}] {}: {}", alert.severity, alert.kind, alert.detail);
                }
            }
            Err(_) => println!("No health report yet"),
        }
        Ok(())
    }
}
