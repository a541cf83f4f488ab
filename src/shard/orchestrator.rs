//! Shard orchestrator
//!
//! Discovers the gateway once, brings shards up through a strictly ordered
//! spawn queue paced by the session-start concurrency allowance, routes
//! guild-scoped commands to the owning shard and replaces shards whose
//! session cannot be resumed.

use crate::config::ShardConfig;
use crate::error::GatewayError;
use crate::events::EventBus;
use crate::gateway::{RequestGuildMembers, UpdatePresence};
use crate::metrics;
use crate::pipeline::TaskPipeline;
use crate::rest::{RateLimitCoordinator, RestRequest};
use crate::shard::connection::{RespawnRequest, ShardConnection, ShardSpawn};
use crate::shard::session::ShardStatus;
use crate::shard::state::FleetState;
use crate::timer::WindowAllowance;

use dashmap::DashMap;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};
use twilight_model::id::marker::GuildMarker;
use twilight_model::id::Id;

/// How long a spawn waits for the transport to open before moving on
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// `GET /gateway/bot`
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until `remaining` resets
    pub reset_after: u64,
    /// Identifies allowed per 5 second window
    pub max_concurrency: u32,
}

/// Owning shard for an entity id
///
/// Fixed by the gateway protocol: `(id >> 22) % total`.
pub fn shard_for_entity(entity_id: u64, total_shards: u32) -> u32 {
    ((entity_id >> 22) % u64::from(total_shards.max(1))) as u32
}

/// Runs and supervises every shard of one bot
///
/// Cheap to clone; clones share shards, the spawn queue and discovery.
#[derive(Debug, Clone)]
pub struct ShardOrchestrator {
    inner: Arc<OrchestratorInner>,
}

#[derive(Debug)]
struct OrchestratorInner {
    rest: RateLimitCoordinator,
    config: Arc<ShardConfig>,
    info: OnceCell<GatewayInfo>,
    total_shards: AtomicU32,
    shards: DashMap<u32, Arc<ShardConnection>>,
    spawn_queue: TaskPipeline,
    allowance: WindowAllowance,
    generation: AtomicU64,
    bus: EventBus,
    fleet: FleetState,
    respawn_tx: mpsc::UnboundedSender<RespawnRequest>,
}

impl Drop for OrchestratorInner {
    fn drop(&mut self) {
        for shard in self.shards.iter() {
            shard.disconnect();
        }
    }
}

impl ShardOrchestrator {
    /// Must be called from within a Tokio runtime
    pub fn new(rest: RateLimitCoordinator, config: ShardConfig) -> Self {
        let (respawn_tx, respawn_rx) = mpsc::unbounded_channel();
        let bus = EventBus::new(config.event_buffer);
        let allowance = WindowAllowance::new(1, config.identify_window);

        let inner = Arc::new(OrchestratorInner {
            rest,
            config: Arc::new(config),
            info: OnceCell::new(),
            total_shards: AtomicU32::new(0),
            shards: DashMap::new(),
            spawn_queue: TaskPipeline::new("spawn"),
            allowance,
            generation: AtomicU64::new(0),
            bus,
            fleet: FleetState::new(),
            respawn_tx,
        });

        tokio::spawn(respawn_listener(Arc::downgrade(&inner), respawn_rx));
        Self { inner }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn fleet(&self) -> &FleetState {
        &self.inner.fleet
    }

    pub fn rest(&self) -> &RateLimitCoordinator {
        &self.inner.rest
    }

    /// Discovery result; fetched once and cached for the process lifetime
    pub async fn gateway_info(&self) -> Result<GatewayInfo, GatewayError> {
        let info = self
            .inner
            .info
            .get_or_try_init(|| async {
                let response = self.inner.rest.request(RestRequest::get("/gateway/bot")).await?;
                let info: GatewayInfo = response.json()?;
                info!(
                    url = %info.url,
                    shards = info.shards,
                    max_concurrency = info.session_start_limit.max_concurrency,
                    sessions_remaining = info.session_start_limit.remaining,
                    "Gateway discovered"
                );
                self.inner
                    .allowance
                    .set_capacity(info.session_start_limit.max_concurrency);
                Ok::<_, GatewayError>(info)
            })
            .await?;
        Ok(info.clone())
    }

    /// Shard count in effect; 0 before [`connect`](Self::connect)
    pub fn total_shards(&self) -> u32 {
        self.inner.total_shards.load(Ordering::Acquire)
    }

    /// Discover the gateway and spawn `shard_ids` (default: every shard)
    ///
    /// Resolves once every requested shard has been brought up.
    pub async fn connect(&self, shard_ids: Option<Vec<u32>>) -> Result<(), GatewayError> {
        let info = self.gateway_info().await?;
        let total = self.inner.config.total_shards.unwrap_or(info.shards).max(1);
        self.inner.total_shards.store(total, Ordering::Release);

        let ids = shard_ids.unwrap_or_else(|| (0..total).collect());
        if let Some(bad) = ids.iter().find(|id| **id >= total) {
            return Err(GatewayError::Config(format!(
                "shard id {bad} is out of range for {total} shards"
            )));
        }

        info!(total, shards = ids.len(), "Connecting shards");
        for id in &ids {
            self.inner.fleet.register(*id);
        }

        let pending: Vec<_> = ids
            .iter()
            .map(|id| (*id, self.queue_spawn(*id, info.url.clone())))
            .collect();
        for (id, spawned) in pending {
            spawned
                .await
                .map_err(|_| GatewayError::SpawnQueueClosed { shard_id: id })??;
        }
        Ok(())
    }

    /// Replace (or start) one shard through the spawn queue
    pub async fn spawn_shard(&self, id: u32) -> Result<(), GatewayError> {
        let info = self.gateway_info().await?;
        if self.total_shards() == 0 {
            let total = self.inner.config.total_shards.unwrap_or(info.shards).max(1);
            self.inner.total_shards.store(total, Ordering::Release);
        }
        self.queue_spawn(id, info.url)
            .await
            .map_err(|_| GatewayError::SpawnQueueClosed { shard_id: id })?
    }

    fn queue_spawn(
        &self,
        id: u32,
        url: String,
    ) -> impl std::future::Future<Output = Result<Result<(), GatewayError>, crate::pipeline::PipelineClosed>>
    {
        let this = self.clone();
        self.inner
            .spawn_queue
            .push(async move { this.spawn_now(id, url).await })
    }

    async fn spawn_now(&self, id: u32, url: String) -> Result<(), GatewayError> {
        if let Some((_, old)) = self.inner.shards.remove(&id) {
            old.disconnect();
        }

        self.inner.allowance.acquire().await;

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (shard, opened) = ShardConnection::spawn(ShardSpawn {
            id,
            total: self.total_shards(),
            gateway_url: url,
            config: Arc::clone(&self.inner.config),
            bus: self.inner.bus.clone(),
            fleet: self.inner.fleet.clone(),
            generation,
            respawn: Some(self.inner.respawn_tx.clone()),
        })?;
        self.inner.shards.insert(id, Arc::new(shard));
        info!(shard_id = id, generation, "Shard spawned");

        match tokio::time::timeout(OPEN_TIMEOUT, opened).await {
            Ok(Ok(())) => debug!(shard_id = id, "Shard transport open"),
            Ok(Err(_)) => warn!(shard_id = id, "Shard stopped before its transport opened"),
            Err(_) => warn!(shard_id = id, timeout = ?OPEN_TIMEOUT, "Shard transport not open yet, continuing"),
        }
        Ok(())
    }

    pub fn shard(&self, id: u32) -> Option<Arc<ShardConnection>> {
        self.inner.shards.get(&id).map(|s| Arc::clone(s.value()))
    }

    /// Ids of the shards currently running, ascending
    pub fn shard_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.inner.shards.iter().map(|s| *s.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn shard_id_for(&self, entity_id: u64) -> u32 {
        shard_for_entity(entity_id, self.total_shards())
    }

    /// Shard owning `entity_id`, if it is running in this process
    pub fn shard_for_entity(&self, entity_id: u64) -> Option<Arc<ShardConnection>> {
        self.shard(self.shard_id_for(entity_id))
    }

    /// Request member chunks from the shard owning the guild
    ///
    /// A no-op when that shard does not exist (yet); nothing is queued.
    pub fn request_guild_members(
        &self,
        guild_id: Id<GuildMarker>,
        options: RequestGuildMembers,
    ) -> Result<(), GatewayError> {
        match self.shard_for_entity(guild_id.get()) {
            Some(shard) => shard.request_guild_members(guild_id, options),
            None => {
                debug!(guild_id = guild_id.get(), "No shard for guild, dropping member request");
                Ok(())
            }
        }
    }

    /// Update presence on every connected shard
    pub fn update_presence(&self, presence: UpdatePresence) -> Result<(), GatewayError> {
        let mut first_error = None;
        for id in self.shard_ids() {
            let Some(shard) = self.shard(id) else {
                continue;
            };
            if let Err(e) = shard.update_presence(presence.clone()) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Shards that closed with a fatal code
    pub fn fatal_errors(&self) -> Vec<GatewayError> {
        self.shard_ids()
            .into_iter()
            .filter_map(|id| self.shard(id)?.fatal_error())
            .collect()
    }

    /// Disconnect and forget every shard
    pub fn disconnect_all(&self) {
        let ids = self.shard_ids();
        info!(shards = ids.len(), "Disconnecting all shards");
        for id in ids {
            if let Some((_, shard)) = self.inner.shards.remove(&id) {
                shard.disconnect();
            }
            self.inner.fleet.set_status(id, ShardStatus::Disconnected);
        }
        metrics::set_shards_ready(0);
    }
}

async fn respawn_listener(
    orchestrator: Weak<OrchestratorInner>,
    mut requests: mpsc::UnboundedReceiver<RespawnRequest>,
) {
    while let Some(request) = requests.recv().await {
        let Some(inner) = orchestrator.upgrade() else {
            break;
        };
        let current = inner
            .shards
            .get(&request.shard_id)
            .map(|s| s.generation());
        if current != Some(request.generation) {
            debug!(
                shard_id = request.shard_id,
                generation = request.generation,
                "Ignoring respawn from superseded shard"
            );
            continue;
        }

        let orchestrator = ShardOrchestrator { inner };
        tokio::spawn(async move {
            if let Err(e) = orchestrator.spawn_shard(request.shard_id).await {
                warn!(shard_id = request.shard_id, error = %e, "Shard respawn failed");
                metrics::record_error(request.shard_id, e.error_type_label());
            }
        });
    }
    debug!("Respawn listener stopped");
}
