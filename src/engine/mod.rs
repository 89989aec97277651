//! Replicated Table Engine
//!
//! Ties the components together for one table replica: startup and replica
//! creation, the insert path with deduplication and optional quorum gating,
//! queue execution, leader-driven selection, the operator status surface,
//! and recovery from coordination-session loss. Background scheduling lives
//! in `tasks`; every periodic duty is also callable directly, one step at a
//! time.

pub mod tasks;

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;

use crate::config::TimberlineConfig;
use crate::coordination::{
    sequence_of, CoordinationStore, CreateMode, Session, SessionFactory, TablePaths, TxnOp,
};
use crate::dedup::DedupLedger;
use crate::election::LeaderElection;
use crate::error::{Error, Result};
use crate::exchange::{Fetcher, PartServer};
use crate::log::{EntryKind, LogEntry, ReplicationLog};
use crate::merge::{MergeSelector, SelectOutcome};
use crate::mutation::{apply_commands, MutationCommand, MutationEntry, MutationLog, MutationState};
use crate::part::{covering_set, Block, PartName};
use crate::queue::{QueuePolicy, QueuedEntry, ReplicaQueue};
use crate::quorum::QuorumCoordinator;
use crate::storage::LocalStore;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Starting,
    Active,
    Reinitializing,
    Shutdown,
}

/// Result of an insert
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// A new part was committed and published
    Inserted { part: PartName },
    /// The block was already inserted within the dedup window; no new part
    Deduplicated { part: Option<PartName> },
}

/// Where a read should go
#[derive(Debug, Clone, PartialEq)]
pub enum ReadMode {
    Local,
    Remote { replica: String, address: String },
}

/// Operator-visible status
#[derive(Debug, Clone, Serialize)]
pub struct TableStatus {
    pub replica_name: String,
    pub state: EngineState,
    pub is_leader: bool,
    pub is_readonly: bool,
    pub queue_length: usize,
    pub log_max_index: u64,
    pub log_pointer: u64,
    pub absolute_delay: u64,
    pub total_replicas: usize,
    pub active_replicas: usize,
    pub last_queue_update: Option<chrono::DateTime<chrono::Utc>>,
    pub last_coordination_error: Option<String>,
}

/// One table replica
pub struct ReplicatedTable {
    config: TimberlineConfig,
    paths: TablePaths,
    replica_name: String,
    session: Session,
    local: Arc<dyn LocalStore>,
    log: ReplicationLog,
    queue: Arc<ReplicaQueue>,
    election: Arc<LeaderElection>,
    selector: MergeSelector,
    fetcher: Arc<Fetcher>,
    quorum: QuorumCoordinator,
    dedup: DedupLedger,
    mutations: MutationLog,
    /// Address the exchange server actually bound
    exchange_address: RwLock<String>,
    /// Partitions currently executing a queue entry
    busy_partitions: Mutex<HashSet<String>>,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    readonly: AtomicBool,
    metadata_version: AtomicU64,
    last_error: std::sync::Mutex<Option<String>>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicatedTable {
    /// Build the engine for one replica. The coordination session is opened
    /// through `factory` so it can be rebuilt wholesale after expiry.
    pub async fn new(
        config: TimberlineConfig,
        factory: SessionFactory,
        local: Arc<dyn LocalStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let paths = TablePaths::new(config.replica.table_path.clone());
        let replica_name = config.replica.replica_name.clone();
        let session = Session::connect(factory).await?;

        let queue = Arc::new(ReplicaQueue::new(
            paths.clone(),
            replica_name.clone(),
            QueuePolicy::from(&config.queue),
        ));
        let fetcher = Arc::new(Fetcher::new(
            paths.clone(),
            replica_name.clone(),
            Arc::clone(&local),
            Duration::from_millis(config.exchange.connect_timeout_ms),
            Duration::from_millis(config.exchange.fetch_timeout_ms),
        ));
        let (state_tx, state_rx) = watch::channel(EngineState::Starting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Arc::new(Self {
            paths: paths.clone(),
            replica_name: replica_name.clone(),
            session,
            local,
            log: ReplicationLog::new(paths.clone()),
            queue,
            election: Arc::new(LeaderElection::new(paths.clone(), replica_name.clone())),
            selector: MergeSelector::new(paths.clone(), replica_name.clone(), config.merges.clone()),
            fetcher,
            quorum: QuorumCoordinator::new(
                paths.clone(),
                replica_name.clone(),
                Duration::from_millis(config.quorum.poll_interval_ms),
            ),
            dedup: DedupLedger::new(paths.clone(), (&config.dedup).into()),
            mutations: MutationLog::new(paths),
            exchange_address: RwLock::new(config.exchange_address().to_string()),
            busy_partitions: Mutex::new(HashSet::new()),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            readonly: AtomicBool::new(true),
            metadata_version: AtomicU64::new(0),
            last_error: std::sync::Mutex::new(None),
            task_handles: Mutex::new(Vec::new()),
            config,
        }))
    }

    /// Full startup: initialize state from the coordination store, start the
    /// part exchange server, and spawn the background task set. Blocks until
    /// the initial log snapshot is pulled (or the table is freshly created).
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        self.start_exchange_server().await?;
        self.initialize().await?;
        tasks::spawn_all(self).await;
        Ok(())
    }

    /// Startup without background tasks; every duty can then be driven one
    /// step at a time. The part exchange server is still started, since
    /// queue execution may need to fetch.
    pub async fn startup_manual(self: &Arc<Self>) -> Result<()> {
        self.start_exchange_server().await?;
        self.initialize().await
    }

    async fn start_exchange_server(self: &Arc<Self>) -> Result<()> {
        let server = Arc::new(PartServer::new(
            Arc::clone(&self.local),
            self.config.exchange.compression,
        ));
        let (listener, bound) = server.bind(&self.config.exchange.bind_address).await?;
        let advertised = match &self.config.exchange.advertise_address {
            Some(address) => address.clone(),
            None => bound,
        };
        *self.exchange_address.write().await = advertised;
        let handle = tokio::spawn(server.run(listener, self.shutdown_rx.clone()));
        self.task_handles.lock().await.push(handle);
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        let store = self.session.store().await;

        self.create_table_if_not_exists(store.as_ref()).await?;
        let is_new = !store.exists(&self.paths.replica(&self.replica_name)).await?;
        if is_new {
            self.create_replica(store.as_ref()).await?;
        }

        // Only one live instance per replica name
        match store
            .create(
                &self.paths.is_active(&self.replica_name),
                self.exchange_address.read().await.as_bytes(),
                CreateMode::Ephemeral,
            )
            .await
        {
            Ok(_) => {}
            Err(Error::NodeExists(_)) => {
                return Err(Error::Coordination(format!(
                    "replica {} is already active elsewhere",
                    self.replica_name
                )));
            }
            Err(e) => return Err(e),
        }

        let address = self.exchange_address.read().await.clone();
        let host_path = self.paths.host(&self.replica_name);
        if store.exists(&host_path).await? {
            store.set(&host_path, address.as_bytes(), None).await?;
        } else {
            store
                .create(&host_path, address.as_bytes(), CreateMode::Persistent)
                .await?;
        }

        if let Some(node) = store.get(&self.paths.metadata_version(&self.replica_name)).await? {
            if let Ok(version) = String::from_utf8_lossy(&node.data).parse() {
                self.metadata_version.store(version, Ordering::SeqCst);
            }
        }

        // Initial snapshot: the replica is usable once its queue mirrors
        // the store
        self.log
            .pull_into_queue(store.as_ref(), &self.replica_name)
            .await?;
        self.queue.sync_from_store(store.as_ref()).await?;

        self.check_parts(store.as_ref()).await?;
        self.queue.sync_from_store(store.as_ref()).await?;

        self.election.register(store.as_ref()).await?;

        self.readonly.store(false, Ordering::SeqCst);
        let _ = self.state_tx.send(EngineState::Active);
        tracing::info!(replica = %self.replica_name, "replica active");
        Ok(())
    }

    async fn create_table_if_not_exists(&self, store: &dyn CoordinationStore) -> Result<()> {
        for dir in [
            self.paths.root().to_string(),
            self.paths.log_dir(),
            self.paths.replicas_dir(),
            self.paths.leader_election_dir(),
            self.paths.blocks_dir(),
            self.paths.block_numbers_dir(),
            self.paths.quorum_dir(),
            self.paths.mutations_dir(),
        ] {
            store.ensure(&dir).await?;
        }
        store.ensure(&self.paths.quorum_last_part()).await?;
        if !store.exists(&self.paths.metadata()).await? {
            match store
                .create(&self.paths.metadata(), b"{}", CreateMode::Persistent)
                .await
            {
                Ok(_) => {
                    tracing::info!(table = %self.paths.root(), "created table");
                }
                Err(Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Create this replica's subtree and enqueue fetches for everything the
    /// other replicas already hold
    async fn create_replica(&self, store: &dyn CoordinationStore) -> Result<()> {
        store.ensure(&self.paths.replica(&self.replica_name)).await?;
        store.ensure(&self.paths.queue_dir(&self.replica_name)).await?;
        store.ensure(&self.paths.parts_dir(&self.replica_name)).await?;

        // Start pulling after the current end of the log; history before
        // that is covered by the seeded fetches below
        let next_index = self
            .log
            .max_index(store)
            .await?
            .map(|index| index + 1)
            .unwrap_or(0);
        store
            .create(
                &self.paths.log_pointer(&self.replica_name),
                next_index.to_string().as_bytes(),
                CreateMode::Persistent,
            )
            .await?;
        store
            .create(
                &self.paths.metadata_version(&self.replica_name),
                b"0",
                CreateMode::Persistent,
            )
            .await?;

        let mut seed_parts = Vec::new();
        for replica in store.children(&self.paths.replicas_dir()).await? {
            if replica == self.replica_name {
                continue;
            }
            match store.children(&self.paths.parts_dir(&replica)).await {
                Ok(parts) => {
                    seed_parts.extend(parts.iter().filter_map(|p| PartName::parse(p).ok()));
                }
                Err(Error::NodeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let seed_parts = covering_set(seed_parts);
        let seeded = seed_parts.len();
        for part in seed_parts {
            self.enqueue_local_get(store, part).await?;
        }

        tracing::info!(
            replica = %self.replica_name,
            seeded,
            "created replica"
        );
        Ok(())
    }

    /// Put a Get entry directly into this replica's queue, outside the
    /// shared log. Used for replica seeding and for re-fetching parts that
    /// went missing locally.
    async fn enqueue_local_get(
        &self,
        store: &dyn CoordinationStore,
        part: PartName,
    ) -> Result<()> {
        let entry = LogEntry::get(self.replica_name.clone(), part, None, None);
        store
            .create(
                &self.paths.queue_entry_prefix(&self.replica_name),
                &entry.serialize()?,
                CreateMode::PersistentSequential,
            )
            .await?;
        Ok(())
    }

    /// Reconcile local committed parts against this replica's registry.
    /// Registered parts missing locally are re-fetched; unregistered local
    /// parts are leftovers and removed, unless there are so many that the
    /// situation smells like an operator error.
    async fn check_parts(&self, store: &dyn CoordinationStore) -> Result<()> {
        let registered: BTreeSet<String> = store
            .children(&self.paths.parts_dir(&self.replica_name))
            .await?
            .into_iter()
            .collect();
        let local_parts = self.local.list_committed_parts().await?;
        let local_names: BTreeSet<String> =
            local_parts.iter().map(|m| m.name.to_string()).collect();

        let unregistered: Vec<&String> = local_names.difference(&registered).collect();
        if unregistered.len() > self.config.replica.max_suspicious_local_parts {
            return Err(Error::SanityCheck(format!(
                "{} local parts are unknown to the coordination store; refusing to remove them",
                unregistered.len()
            )));
        }
        for name in unregistered {
            let part = PartName::parse(name)?;
            tracing::warn!(part = %part, "removing local part unknown to the coordination store");
            self.local.remove_part(&part).await?;
        }

        let queued: HashSet<PartName> = self.queue.future_parts().await;
        for name in registered.difference(&local_names) {
            let part = PartName::parse(name)?;
            let covered = self.local.covering_part(&part).await?.is_some();
            if !covered && !queued.contains(&part) {
                tracing::warn!(part = %part, "registered part missing locally, scheduling fetch");
                self.enqueue_local_get(store, part).await?;
            }
        }
        Ok(())
    }

    // ---------- insert path ----------

    /// Insert a block. `quorum` overrides the configured default; `Some(n)`
    /// with `n > 1` blocks until `n` replicas confirm durable storage.
    pub async fn insert(&self, block: Block, quorum: Option<usize>) -> Result<InsertOutcome> {
        if self.readonly.load(Ordering::SeqCst) {
            return Err(Error::Readonly);
        }
        let store = self.session.store().await;
        let partition = block.partition_id.clone();

        let block_id = self.dedup.enabled().then(|| DedupLedger::block_id(&block));
        if let Some(hash) = &block_id {
            if let Some(existing) = self.dedup.lookup(store.as_ref(), &partition, hash).await? {
                tracing::debug!(partition = %partition, part = %existing, "duplicate block, insert is a no-op");
                return Ok(InsertOutcome::Deduplicated {
                    part: PartName::parse(&existing).ok(),
                });
            }
        }

        let required = match quorum.or((self.config.quorum.insert_quorum > 0)
            .then_some(self.config.quorum.insert_quorum))
        {
            Some(n) if n > 1 => Some(n),
            _ => None,
        };

        let active = self.active_replicas(store.as_ref()).await?;
        if let Some(n) = required {
            if active.len() < n {
                return Err(Error::QuorumBroken {
                    part: String::new(),
                    confirmed: 1,
                    required: n,
                });
            }
            self.clear_stale_quorum(store.as_ref()).await?;
        }

        store.ensure(&self.paths.blocks_partition(&partition)).await?;
        store
            .ensure(&self.paths.block_numbers_partition(&partition))
            .await?;

        let temp = self.local.write_temp_part(&block).await?;

        // The block-number node stays until the insert resolves; merge
        // selection treats it as a reservation it must not merge across
        let number_path = store
            .create(
                &self.paths.block_number_prefix(&partition),
                &[],
                CreateMode::EphemeralSequential,
            )
            .await?;
        let number = sequence_of(number_path.rsplit('/').next().unwrap_or(&number_path))?;
        let part = PartName::new_single(partition.clone(), number);

        let entry = LogEntry::get(
            self.replica_name.clone(),
            part.clone(),
            block_id.clone(),
            required,
        );

        let mut ops = Vec::new();
        let dedup_op_index = block_id.as_ref().map(|hash| {
            ops.push(self.dedup.register_op(&partition, hash, &part.to_string()));
            0
        });
        ops.push(TxnOp::Create {
            path: self.paths.part(&self.replica_name, &part.to_string()),
            data: Vec::new(),
            mode: CreateMode::Persistent,
        });
        ops.push(self.log.publish_op(&entry)?);
        if let Some(n) = required {
            ops.push(self.quorum.status_create_op(&part, n, &active)?);
        }

        let publish = store.multi(ops).await;
        match publish {
            Ok(_) => {}
            Err(Error::TxnFailed { index, .. }) if Some(index) == dedup_op_index => {
                // A concurrent identical insert won the transaction
                let _ = store.remove(&number_path, None).await;
                let existing = match &block_id {
                    Some(hash) => self.dedup.lookup(store.as_ref(), &partition, hash).await?,
                    None => None,
                };
                return Ok(InsertOutcome::Deduplicated {
                    part: existing.and_then(|p| PartName::parse(&p).ok()),
                });
            }
            Err(e) => {
                let _ = store.remove(&number_path, None).await;
                return Err(e);
            }
        }

        self.local.commit_part(temp, &part).await?;
        let _ = store.remove(&number_path, None).await;
        tracing::info!(part = %part, quorum = ?required, "inserted part");

        if let Some(n) = required {
            self.quorum
                .wait(store.as_ref(), &part, n, self.config.quorum_timeout())
                .await?;
        }
        Ok(InsertOutcome::Inserted { part })
    }

    /// A status node left behind by a finished or abandoned quorum insert
    /// must not block new ones
    async fn clear_stale_quorum(&self, store: &dyn CoordinationStore) -> Result<()> {
        let Some(node) = store.get(&self.paths.quorum_status()).await? else {
            return Ok(());
        };
        let status: crate::quorum::QuorumStatus = serde_json::from_slice(&node.data)?;
        if status.satisfied() {
            let _ = store.remove(&self.paths.quorum_status(), Some(node.version)).await;
            return Ok(());
        }
        Err(Error::Coordination(
            "another quorum insert is in flight".into(),
        ))
    }

    async fn active_replicas(&self, store: &dyn CoordinationStore) -> Result<BTreeSet<String>> {
        let mut active = BTreeSet::new();
        for replica in store.children(&self.paths.replicas_dir()).await? {
            if store.exists(&self.paths.is_active(&replica)).await? {
                active.insert(replica);
            }
        }
        Ok(active)
    }

    // ---------- queue execution ----------

    /// Pull new log entries into the queue
    pub async fn pull_log(&self) -> Result<usize> {
        let store = self.session.store().await;
        let pulled = self
            .log
            .pull_into_queue(store.as_ref(), &self.replica_name)
            .await?;
        self.queue.sync_from_store(store.as_ref()).await?;
        Ok(pulled)
    }

    /// Execute at most one ready queue entry. Returns whether any entry was
    /// attempted.
    pub async fn execute_queue_step(&self) -> Result<bool> {
        let queued = {
            let mut busy = self.busy_partitions.lock().await;
            match self.queue.next_ready(&busy).await {
                Some(queued) => {
                    if let Some(partition) = queued.entry.partition_id() {
                        busy.insert(partition.to_string());
                    }
                    Some(queued)
                }
                None => None,
            }
        };
        let Some(queued) = queued else {
            return Ok(false);
        };

        let result = self.execute_entry(&queued).await;

        if let Some(partition) = queued.entry.partition_id() {
            self.busy_partitions.lock().await.remove(partition);
        }

        match result {
            Ok(()) => {
                let store = self.session.store().await;
                self.queue.complete(store.as_ref(), &queued.node).await?;
                Ok(true)
            }
            Err(e) => {
                self.note_error(&e);
                self.queue.fail(&queued.node, &e).await;
                if e.triggers_reinit() {
                    return Err(e);
                }
                Ok(true)
            }
        }
    }

    /// Run pull + execution until the queue drains or `timeout` elapses.
    /// Postponed entries are waited out within the deadline.
    pub async fn sync_queue(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.pull_log().await?;
            while self.execute_queue_step().await? {}
            if self.queue.is_empty().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::EntryExecution {
                    entry: "queue".into(),
                    reason: format!("queue not drained within {:?}", timeout),
                });
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn execute_entry(&self, queued: &QueuedEntry) -> Result<()> {
        let store = self.session.store().await;
        let entry = &queued.entry;
        tracing::debug!(entry = %entry.describe(), "executing queue entry");

        match entry.kind {
            EntryKind::Get | EntryKind::AttachPart => {
                self.execute_fetch(store.as_ref(), queued).await
            }
            EntryKind::MergeParts => self.execute_merge(store.as_ref(), entry).await,
            EntryKind::MutatePart => self.execute_mutate(store.as_ref(), entry).await,
            EntryKind::DropRange => self.execute_drop_range(store.as_ref(), queued).await,
            EntryKind::ReplaceRange => self.execute_replace_range(store.as_ref(), queued).await,
            EntryKind::AlterMetadata => self.execute_alter_metadata(store.as_ref(), entry).await,
        }
    }

    fn entry_target(entry: &LogEntry) -> Result<&PartName> {
        entry.target_part().ok_or_else(|| Error::EntryExecution {
            entry: entry.describe(),
            reason: "entry has no target part".into(),
        })
    }

    /// A part already present locally (exactly or via a covering part)
    /// satisfies the entry outright
    async fn already_satisfied(
        &self,
        store: &dyn CoordinationStore,
        target: &PartName,
    ) -> Result<bool> {
        if self.local.contains(target).await? {
            self.publish_part(store, target).await?;
            return Ok(true);
        }
        Ok(self.local.covering_part(target).await?.is_some())
    }

    async fn publish_part(&self, store: &dyn CoordinationStore, part: &PartName) -> Result<()> {
        let path = self.paths.part(&self.replica_name, &part.to_string());
        match store.create(&path, &[], CreateMode::Persistent).await {
            Ok(_) | Err(Error::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn execute_fetch(
        &self,
        store: &dyn CoordinationStore,
        queued: &QueuedEntry,
    ) -> Result<()> {
        let entry = &queued.entry;
        let target = Self::entry_target(entry)?;
        if !self.already_satisfied(store, target).await? {
            // The target may have been superseded by a merge on its source;
            // fetching whatever covers it is equally correct.
            let installed = self.fetcher.fetch_part(store, target).await?;
            if &installed != target {
                tracing::debug!(
                    target = %target,
                    installed = %installed,
                    "entry resolved to covering part"
                );
                self.queue.note_resolved(&queued.node, installed).await;
            }
        }
        // Quorum bookkeeping updates exactly once, after durable install;
        // the confirmation set makes retries harmless
        if entry.quorum.is_some() {
            self.quorum.confirm(store, target).await?;
        }
        Ok(())
    }

    async fn execute_merge(&self, store: &dyn CoordinationStore, entry: &LogEntry) -> Result<()> {
        let target = Self::entry_target(entry)?;
        if self.already_satisfied(store, target).await? {
            return Ok(());
        }

        let mut have_all = true;
        for source in &entry.source_parts {
            if !self.local.contains(source).await? {
                have_all = false;
                break;
            }
        }

        if have_all {
            let mut sources = entry.source_parts.clone();
            sources.sort_by_key(|p| p.min_block);
            let mut rows = Vec::new();
            for source in &sources {
                rows.extend(self.local.read_block(source).await?.rows);
            }
            let merged = Block::new(target.partition_id.clone(), rows);
            let temp = self.local.write_temp_part(&merged).await?;
            self.local.commit_part(temp, target).await?;
            self.publish_part(store, target).await?;
            tracing::info!(part = %target, sources = sources.len(), "merged parts");
            Ok(())
        } else {
            // Diverged local state: someone already merged past us, so take
            // the result instead of the ingredients
            self.fetcher.fetch_part(store, target).await?;
            Ok(())
        }
    }

    async fn execute_mutate(&self, store: &dyn CoordinationStore, entry: &LogEntry) -> Result<()> {
        let target = Self::entry_target(entry)?;
        if self.already_satisfied(store, target).await? {
            return Ok(());
        }

        let version = entry.mutation_version.ok_or_else(|| Error::EntryExecution {
            entry: entry.describe(),
            reason: "mutate entry without version".into(),
        })?;
        let source = entry.source_parts.first().ok_or_else(|| Error::EntryExecution {
            entry: entry.describe(),
            reason: "mutate entry without source part".into(),
        })?;

        let mutation = self
            .mutations
            .load_all(store)
            .await?
            .into_iter()
            .find(|m| m.version == version);
        let Some(mutation) = mutation else {
            // The mutation was killed; nothing to apply
            tracing::warn!(version, "mutation no longer exists, skipping entry");
            return Ok(());
        };

        if self.local.contains(source).await? {
            let block = self.local.read_block(source).await?;
            let mutated = apply_commands(&mutation.commands, block);
            let temp = self.local.write_temp_part(&mutated).await?;
            self.local.commit_part(temp, target).await?;
            self.publish_part(store, target).await?;
            tracing::info!(part = %target, "mutated part");
            Ok(())
        } else {
            self.fetcher.fetch_part(store, target).await?;
            Ok(())
        }
    }

    async fn execute_drop_range(
        &self,
        store: &dyn CoordinationStore,
        queued: &QueuedEntry,
    ) -> Result<()> {
        let range = Self::entry_target(&queued.entry)?;

        // Entries producing parts inside the range will never be needed
        self.queue.drop_subsumed(store, range, &queued.node).await?;

        let local_parts = self.local.list_committed_parts().await?;
        let mut dropped = 0;
        for meta in local_parts {
            if range.covers(&meta.name) {
                self.local.remove_part(&meta.name).await?;
                let path = self.paths.part(&self.replica_name, &meta.name.to_string());
                match store.remove(&path, None).await {
                    Ok(()) | Err(Error::NodeNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                dropped += 1;
            }
        }
        tracing::info!(range = %range, dropped, "dropped part range");
        Ok(())
    }

    async fn execute_replace_range(
        &self,
        store: &dyn CoordinationStore,
        queued: &QueuedEntry,
    ) -> Result<()> {
        let entry = &queued.entry;
        let range = Self::entry_target(entry)?;
        let replacements: HashSet<&PartName> = entry.source_parts.iter().collect();

        let local_parts = self.local.list_committed_parts().await?;
        let mut dropped = 0;
        for meta in local_parts {
            if range.covers(&meta.name) && !replacements.contains(&meta.name) {
                self.local.remove_part(&meta.name).await?;
                let path = self.paths.part(&self.replica_name, &meta.name.to_string());
                match store.remove(&path, None).await {
                    Ok(()) | Err(Error::NodeNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                dropped += 1;
            }
        }

        for part in &entry.source_parts {
            if !self.already_satisfied(store, part).await? {
                self.fetcher.fetch_part(store, part).await?;
            }
        }
        tracing::info!(range = %range, dropped, obtained = entry.source_parts.len(), "replaced part range");
        Ok(())
    }

    async fn execute_alter_metadata(
        &self,
        store: &dyn CoordinationStore,
        entry: &LogEntry,
    ) -> Result<()> {
        let version = entry.metadata_version.unwrap_or(0);
        store
            .set(
                &self.paths.metadata_version(&self.replica_name),
                version.to_string().as_bytes(),
                None,
            )
            .await?;
        self.metadata_version.store(version, Ordering::SeqCst);
        tracing::info!(version, "applied metadata change");
        Ok(())
    }

    // ---------- leader duties ----------

    /// One merge-selection attempt; only the leader acts
    pub async fn select_merge_once(&self) -> Result<SelectOutcome> {
        if !self.election.is_leader() {
            return Ok(SelectOutcome::Postponed("not the leader".into()));
        }
        let store = self.session.store().await;
        self.selector
            .select_merge(store.as_ref(), self.local.as_ref(), &self.queue)
            .await
    }

    /// One mutation-scheduling attempt; only the leader acts
    pub async fn select_mutation_once(&self) -> Result<SelectOutcome> {
        if !self.election.is_leader() {
            return Ok(SelectOutcome::Postponed("not the leader".into()));
        }
        let store = self.session.store().await;
        let mutations = self.mutations.load_all(store.as_ref()).await?;
        self.selector
            .select_mutation(store.as_ref(), self.local.as_ref(), &self.queue, &mutations)
            .await
    }

    /// Mark mutations whose parts are all rewritten as done; only the leader
    /// acts
    pub async fn finalize_mutations_once(&self) -> Result<usize> {
        if !self.election.is_leader() {
            return Ok(0);
        }
        let store = self.session.store().await;
        let parts = self.local.list_committed_parts().await?;
        let mut finished = 0;
        for mutation in self.mutations.load_all(store.as_ref()).await? {
            if !mutation.done && mutation.state(&parts) == MutationState::Done {
                self.mutations.mark_done(store.as_ref(), &mutation).await?;
                finished += 1;
            }
        }
        Ok(finished)
    }

    /// Re-evaluate leadership after election-dir changes
    pub async fn refresh_leadership(&self) -> Result<bool> {
        let store = self.session.store().await;
        self.election.refresh(store.as_ref()).await
    }

    // ---------- cleanup ----------

    /// Retire superseded parts, trim the dedup ledger, and truncate log
    /// entries every replica has pulled
    pub async fn run_cleanup_once(&self) -> Result<()> {
        let store = self.session.store().await;

        let removed = self
            .local
            .cleanup_outdated(Duration::from_secs(self.config.cleanup.outdated_part_ttl_secs))
            .await?;
        for part in removed {
            let path = self.paths.part(&self.replica_name, &part.to_string());
            match store.remove(&path, None).await {
                Ok(()) | Err(Error::NodeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        self.dedup.trim(store.as_ref()).await?;
        self.trim_log(store.as_ref()).await?;
        Ok(())
    }

    /// Remove log entries below every replica's pointer, keeping a fixed
    /// recent window
    async fn trim_log(&self, store: &dyn CoordinationStore) -> Result<()> {
        let Some(max_index) = self.log.max_index(store).await? else {
            return Ok(());
        };

        let mut min_pointer = u64::MAX;
        for replica in store.children(&self.paths.replicas_dir()).await? {
            min_pointer = min_pointer.min(self.log.pointer(store, &replica).await?);
        }
        if min_pointer == u64::MAX {
            return Ok(());
        }

        let keep_from = (max_index + 1).saturating_sub(self.config.cleanup.log_keep);
        let cutoff = min_pointer.min(keep_from);

        for name in store.children(&self.paths.log_dir()).await? {
            if sequence_of(&name).map_or(false, |seq| seq < cutoff) {
                match store.remove(&self.paths.log_entry(&name), None).await {
                    Ok(()) | Err(Error::NodeNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Verify registered parts still exist locally; anything missing is
    /// re-fetched
    pub async fn run_part_check_once(&self) -> Result<()> {
        let store = self.session.store().await;
        let registered = store
            .children(&self.paths.parts_dir(&self.replica_name))
            .await?;
        let queued = self.queue.future_parts().await;
        for name in registered {
            let part = PartName::parse(&name)?;
            if !self.local.contains(&part).await?
                && self.local.covering_part(&part).await?.is_none()
                && !queued.contains(&part)
            {
                tracing::warn!(part = %part, "registered part lost locally, scheduling fetch");
                self.enqueue_local_get(store.as_ref(), part).await?;
            }
        }
        Ok(())
    }

    // ---------- partition management ----------

    /// Drop every part of a partition on all replicas
    pub async fn drop_partition(&self, partition: &str) -> Result<()> {
        if self.readonly.load(Ordering::SeqCst) {
            return Err(Error::Readonly);
        }
        let range = PartName {
            partition_id: partition.to_string(),
            min_block: 0,
            max_block: u64::MAX,
            level: u32::MAX,
            mutation: None,
        };
        let entry = LogEntry::drop_range(self.replica_name.clone(), range);
        let store = self.session.store().await;
        self.log.publish(store.as_ref(), &entry).await?;
        Ok(())
    }

    /// Publish a part this replica already holds so every replica obtains it
    pub async fn attach_part(&self, part: &PartName) -> Result<()> {
        if self.readonly.load(Ordering::SeqCst) {
            return Err(Error::Readonly);
        }
        if !self.local.contains(part).await? {
            return Err(Error::PartNotFound(part.to_string()));
        }
        let store = self.session.store().await;
        self.publish_part(store.as_ref(), part).await?;
        let entry = LogEntry::attach_part(self.replica_name.clone(), part.clone());
        self.log.publish(store.as_ref(), &entry).await?;
        Ok(())
    }

    /// Replace a block range with parts this replica already holds: every
    /// replica drops the range and obtains the replacements
    pub async fn replace_range(&self, range: PartName, new_parts: Vec<PartName>) -> Result<()> {
        if self.readonly.load(Ordering::SeqCst) {
            return Err(Error::Readonly);
        }
        let store = self.session.store().await;
        for part in &new_parts {
            if !self.local.contains(part).await? {
                return Err(Error::PartNotFound(part.to_string()));
            }
            self.publish_part(store.as_ref(), part).await?;
        }
        let entry = LogEntry::replace_range(self.replica_name.clone(), range, new_parts);
        self.log.publish(store.as_ref(), &entry).await?;
        Ok(())
    }

    // ---------- mutations / metadata ----------

    /// Submit a mutation; parts committed before this call will be rewritten
    pub async fn submit_mutation(&self, commands: Vec<MutationCommand>) -> Result<MutationEntry> {
        if self.readonly.load(Ordering::SeqCst) {
            return Err(Error::Readonly);
        }
        let store = self.session.store().await;

        // Freeze the mutation's scope: one block number per known partition
        let mut frozen = std::collections::BTreeMap::new();
        for partition in store.children(&self.paths.block_numbers_dir()).await? {
            let path = store
                .create(
                    &self.paths.block_number_prefix(&partition),
                    &[],
                    CreateMode::EphemeralSequential,
                )
                .await?;
            let number = sequence_of(path.rsplit('/').next().unwrap_or(&path))?;
            let _ = store.remove(&path, None).await;
            frozen.insert(partition, number);
        }

        self.mutations
            .submit(store.as_ref(), &self.replica_name, commands, frozen)
            .await
    }

    /// Block until a mutation finishes or the timeout elapses
    pub async fn wait_mutation(&self, id: &str, timeout: Duration) -> Result<()> {
        let store = self.session.store().await;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let entry = self.mutations.load(store.as_ref(), id).await?;
            if entry.done {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::EntryExecution {
                    entry: id.to_string(),
                    reason: format!("mutation not finished within {:?}", timeout),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Change table metadata and replicate the change
    pub async fn alter_metadata(&self, metadata: serde_json::Value) -> Result<u64> {
        if self.readonly.load(Ordering::SeqCst) {
            return Err(Error::Readonly);
        }
        let store = self.session.store().await;
        let version = store
            .set(&self.paths.metadata(), &serde_json::to_vec(&metadata)?, None)
            .await?;
        let entry = LogEntry::alter_metadata(self.replica_name.clone(), metadata, version);
        self.log.publish(store.as_ref(), &entry).await?;
        Ok(version)
    }

    // ---------- recovery ----------

    /// Rebuild after coordination-session loss: fresh session, fresh
    /// ephemerals, queue and election state rebuilt from the store
    pub async fn reinitialize(&self) -> Result<()> {
        let _ = self.state_tx.send(EngineState::Reinitializing);
        self.readonly.store(true, Ordering::SeqCst);
        self.election.reset().await;
        tracing::warn!(replica = %self.replica_name, "coordination session lost, reinitializing");

        loop {
            if *self.shutdown_rx.borrow() {
                return Err(Error::ShuttingDown);
            }
            match self.try_reinitialize().await {
                Ok(()) => {
                    self.readonly.store(false, Ordering::SeqCst);
                    let _ = self.state_tx.send(EngineState::Active);
                    tracing::info!(replica = %self.replica_name, "replica active again");
                    return Ok(());
                }
                Err(e) => {
                    self.note_error(&e);
                    tracing::warn!(error = %e, "reinitialization attempt failed");
                    tokio::time::sleep(self.config.reconnect_backoff()).await;
                }
            }
        }
    }

    async fn try_reinitialize(&self) -> Result<()> {
        let store = self.session.renew().await?;

        match store
            .create(
                &self.paths.is_active(&self.replica_name),
                self.exchange_address.read().await.as_bytes(),
                CreateMode::Ephemeral,
            )
            .await
        {
            // A previous incarnation's node may linger until its session
            // fully dies; treat it as ours
            Ok(_) | Err(Error::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }

        self.queue.rebuild(store.as_ref()).await?;
        self.election.register(store.as_ref()).await?;
        Ok(())
    }

    // ---------- read path / status ----------

    /// Decide once, lazily, whether a read should run locally or be handed
    /// to a fresher replica
    pub fn read_decision(self: &Arc<Self>, max_delay: Duration) -> ReadDecision {
        ReadDecision {
            table: Arc::clone(self),
            max_delay,
            cell: OnceCell::new(),
        }
    }

    async fn decide_read_mode(&self, max_delay: Duration) -> Result<ReadMode> {
        let delay = self.queue.absolute_delay().await;
        if delay <= max_delay.as_secs() && !self.readonly.load(Ordering::SeqCst) {
            return Ok(ReadMode::Local);
        }

        // Look for an active replica that has caught up further
        let store = self.session.store().await;
        let max_index = self.log.max_index(store.as_ref()).await?.map_or(0, |i| i + 1);
        let mut best: Option<(u64, String, String)> = None;
        for replica in self.active_replicas(store.as_ref()).await? {
            if replica == self.replica_name {
                continue;
            }
            let pointer = self.log.pointer(store.as_ref(), &replica).await?;
            let lag = max_index.saturating_sub(pointer);
            let Some(host) = store.get(&self.paths.host(&replica)).await? else {
                continue;
            };
            let address = String::from_utf8_lossy(&host.data).into_owned();
            if best.as_ref().map_or(true, |(l, _, _)| lag < *l) {
                best = Some((lag, replica, address));
            }
        }

        match best {
            Some((0, replica, address)) => Ok(ReadMode::Remote { replica, address }),
            _ => Err(Error::StaleReplicaReadonly { delay_secs: delay }),
        }
    }

    /// Operator status snapshot; coordination-store failures degrade the
    /// snapshot instead of failing it
    pub async fn status(&self) -> TableStatus {
        let store = self.session.store().await;
        let state = *self.state_rx.borrow();
        let mut status = TableStatus {
            replica_name: self.replica_name.clone(),
            state,
            is_leader: self.election.is_leader(),
            is_readonly: self.readonly.load(Ordering::SeqCst),
            queue_length: self.queue.len().await,
            log_max_index: 0,
            log_pointer: 0,
            absolute_delay: self.queue.absolute_delay().await,
            total_replicas: 0,
            active_replicas: 0,
            last_queue_update: self.queue.last_update_time().await,
            last_coordination_error: self.last_error.lock().unwrap().clone(),
        };

        let coordination_fields = async {
            let max_index = self.log.max_index(store.as_ref()).await?.map_or(0, |i| i + 1);
            let pointer = self.log.pointer(store.as_ref(), &self.replica_name).await?;
            let total = store.children(&self.paths.replicas_dir()).await?.len();
            let active = self.active_replicas(store.as_ref()).await?.len();
            Ok::<_, Error>((max_index, pointer, total, active))
        };
        match coordination_fields.await {
            Ok((max_index, pointer, total, active)) => {
                status.log_max_index = max_index;
                status.log_pointer = pointer;
                status.total_replicas = total;
                status.active_replicas = active;
            }
            Err(e) => {
                self.note_error(&e);
                status.last_coordination_error = Some(e.to_string());
            }
        }
        status
    }

    pub async fn queue_summaries(&self) -> Vec<crate::queue::QueueEntrySummary> {
        self.queue.summaries().await
    }

    pub async fn local_parts(&self) -> Result<Vec<String>> {
        Ok(self
            .local
            .list_committed_parts()
            .await?
            .into_iter()
            .map(|m| m.name.to_string())
            .collect())
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::SeqCst)
    }

    pub async fn absolute_delay(&self) -> u64 {
        self.queue.absolute_delay().await
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn replica_name(&self) -> &str {
        &self.replica_name
    }

    /// Version of the table metadata this replica has applied
    pub fn metadata_version(&self) -> u64 {
        self.metadata_version.load(Ordering::SeqCst)
    }

    pub(crate) fn config(&self) -> &TimberlineConfig {
        &self.config
    }

    pub(crate) fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub(crate) async fn session_expired_watch(&self) -> watch::Receiver<bool> {
        self.session.expired_watch().await
    }

    pub(crate) fn note_error(&self, error: &Error) {
        *self.last_error.lock().unwrap() = Some(error.to_string());
    }

    pub(crate) async fn push_task_handle(&self, handle: JoinHandle<()>) {
        self.task_handles.lock().await.push(handle);
    }

    // ---------- shutdown ----------

    /// Signal all tasks and wait, with a bounded grace period, for in-flight
    /// work to reach a safe checkpoint
    pub async fn shutdown(&self) {
        let _ = self.state_tx.send(EngineState::Shutdown);
        self.readonly.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let store = self.session.store().await;
        let _ = self.election.resign(store.as_ref()).await;
        let _ = store
            .remove(&self.paths.is_active(&self.replica_name), None)
            .await;

        let handles: Vec<JoinHandle<()>> = self.task_handles.lock().await.drain(..).collect();
        let grace = Duration::from_secs(10);
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!("background tasks did not stop within the grace period");
        }
        tracing::info!(replica = %self.replica_name, "replica shut down");
    }
}

/// Deferred local-vs-remote read decision: constructed cheaply, evaluated at
/// most once, at first consumption
pub struct ReadDecision {
    table: Arc<ReplicatedTable>,
    max_delay: Duration,
    cell: OnceCell<ReadMode>,
}

impl ReadDecision {
    /// Resolve the decision (computed on first call, cached afterwards)
    pub async fn resolve(&self) -> Result<&ReadMode> {
        self.cell
            .get_or_try_init(|| self.table.decide_read_mode(self.max_delay))
            .await
    }
}
