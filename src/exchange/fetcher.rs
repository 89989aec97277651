//! Part Fetcher
//!
//! Locates a replica holding the exact part or a covering part, downloads
//! into a temporary part, verifies every checksum, and installs atomically.
//! A per-replica in-progress set suppresses duplicate concurrent fetches;
//! a checksum mismatch rejects the source and the next candidate is tried.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{read_frame, write_frame, Request, Response};
use crate::coordination::{CoordinationStore, CreateMode, TablePaths};
use crate::error::{Error, Result};
use crate::part::{PartFiles, PartName};
use crate::storage::LocalStore;

/// One candidate source for a part
#[derive(Debug, Clone)]
struct Source {
    replica: String,
    address: String,
    /// The part the source actually holds: the target or a covering part
    part: PartName,
    active: bool,
}

/// Downloads parts from other replicas
pub struct Fetcher {
    paths: TablePaths,
    replica_name: String,
    local: Arc<dyn LocalStore>,
    connect_timeout: Duration,
    fetch_timeout: Duration,
    /// Parts currently being fetched by this replica
    in_progress: Mutex<HashSet<String>>,
}

impl Fetcher {
    pub fn new(
        paths: TablePaths,
        replica_name: impl Into<String>,
        local: Arc<dyn LocalStore>,
        connect_timeout: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            paths,
            replica_name: replica_name.into(),
            local,
            connect_timeout,
            fetch_timeout,
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    /// Fetch `part` (or a covering part) from some replica, verify it, and
    /// install it. Returns the name actually installed and publishes it
    /// under this replica's part registry.
    pub async fn fetch_part(
        &self,
        store: &dyn CoordinationStore,
        part: &PartName,
    ) -> Result<PartName> {
        let key = part.to_string();
        {
            let mut in_progress = self.in_progress.lock().await;
            if !in_progress.insert(key.clone()) {
                return Err(Error::FetchInProgress(key));
            }
        }

        let result = self.fetch_inner(store, part).await;
        self.in_progress.lock().await.remove(&key);
        result
    }

    async fn fetch_inner(
        &self,
        store: &dyn CoordinationStore,
        part: &PartName,
    ) -> Result<PartName> {
        let sources = self.find_sources(store, part).await?;
        if sources.is_empty() {
            return Err(Error::NoSourceReplica(part.to_string()));
        }

        let mut last_error = None;
        for source in &sources {
            match self.download(source).await {
                Ok(files) => {
                    let temp = self.local.write_temp_files(files).await?;
                    self.local.commit_part(temp, &source.part).await?;
                    self.publish_part(store, &source.part).await?;
                    tracing::info!(
                        part = %source.part,
                        from = %source.replica,
                        "fetched and installed part"
                    );
                    return Ok(source.part.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        part = %source.part,
                        from = %source.replica,
                        error = %e,
                        "fetch attempt failed, trying next source"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::NoSourceReplica(part.to_string())))
    }

    /// Register the installed part in the coordination store
    async fn publish_part(&self, store: &dyn CoordinationStore, part: &PartName) -> Result<()> {
        let path = self.paths.part(&self.replica_name, &part.to_string());
        match store.create(&path, &[], CreateMode::Persistent).await {
            Ok(_) | Err(Error::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Candidate sources: replicas advertising the exact part or a covering
    /// part. Active replicas come first; order within each class is
    /// pseudo-random.
    async fn find_sources(
        &self,
        store: &dyn CoordinationStore,
        part: &PartName,
    ) -> Result<Vec<Source>> {
        let replicas = store.children(&self.paths.replicas_dir()).await?;
        let mut sources = Vec::new();

        for replica in replicas {
            if replica == self.replica_name {
                continue;
            }
            let parts = match store.children(&self.paths.parts_dir(&replica)).await {
                Ok(parts) => parts,
                Err(Error::NodeNotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            // Prefer the exact part, else the widest covering part
            let best = parts
                .iter()
                .filter_map(|p| PartName::parse(p).ok())
                .filter(|p| p.covers(part))
                .max_by_key(|p| {
                    let exact = p == part;
                    (exact, p.max_block - p.min_block, p.level)
                });

            let Some(best) = best else { continue };
            let Some(host) = store.get(&self.paths.host(&replica)).await? else {
                continue;
            };
            let active = store.exists(&self.paths.is_active(&replica)).await?;
            sources.push(Source {
                replica,
                address: String::from_utf8_lossy(&host.data).into_owned(),
                part: best,
                active,
            });
        }

        let mut rng = rand::thread_rng();
        sources.shuffle(&mut rng);
        sources.sort_by_key(|s| !s.active);
        Ok(sources)
    }

    /// Download and verify one part from one source
    async fn download(&self, source: &Source) -> Result<PartFiles> {
        let result = timeout(self.fetch_timeout, self.download_inner(source)).await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::ConnectionTimeout(source.address.clone())),
        }
    }

    async fn download_inner(&self, source: &Source) -> Result<PartFiles> {
        let connect = timeout(self.connect_timeout, TcpStream::connect(&source.address)).await;
        let mut stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address: source.address.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(source.address.clone())),
        };
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.split();

        write_frame(
            &mut writer,
            &Request::FetchPart {
                part: source.part.to_string(),
            },
        )
        .await?;

        let mismatch = |reason: String| Error::PartMismatch {
            part: source.part.to_string(),
            source_replica: source.replica.clone(),
            reason,
        };

        let (manifest, compressed) = match read_frame(&mut reader).await? {
            Response::Manifest {
                manifest,
                compressed,
                ..
            } => (manifest, compressed),
            Response::Error { message } => return Err(Error::Network(message)),
            _ => return Err(mismatch("response did not start with a manifest".into())),
        };

        let mut files = PartFiles::default();
        loop {
            match read_frame(&mut reader).await? {
                Response::FileData { name, data } => {
                    let data = if compressed {
                        lz4_flex::decompress_size_prepended(&data)
                            .map_err(|e| mismatch(format!("decompression failed: {}", e)))?
                    } else {
                        data
                    };
                    manifest
                        .verify_file(&name, &data)
                        .map_err(|e| mismatch(e.to_string()))?;
                    files.files.insert(name, data);
                }
                Response::Done => break,
                Response::Error { message } => return Err(Error::Network(message)),
                Response::Manifest { .. } => {
                    return Err(mismatch("unexpected second manifest".into()))
                }
            }
        }

        if files.files.len() != manifest.files.len() {
            return Err(mismatch(format!(
                "incomplete part: {}/{} files",
                files.files.len(),
                manifest.files.len()
            )));
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordination;
    use crate::exchange::PartServer;
    use crate::part::Block;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use tokio::sync::watch;

    async fn commit(store: &MemoryStore, name: &str, rows: Vec<serde_json::Value>) {
        let name = PartName::parse(name).unwrap();
        let block = Block::new(name.partition_id.clone(), rows);
        let temp = store.write_temp_part(&block).await.unwrap();
        store.commit_part(temp, &name).await.unwrap();
    }

    /// Spin up a server for `local` and register replica `name` with its
    /// address in the coordination store
    async fn register_replica(
        coord: &MemoryCoordination,
        name: &str,
        local: Arc<MemoryStore>,
    ) -> (
        std::sync::Arc<crate::coordination::memory::MemorySession>,
        watch::Sender<bool>,
    ) {
        let session = coord.session();
        session
            .ensure(&format!("/t/replicas/{}/parts", name))
            .await
            .unwrap();

        let server = Arc::new(PartServer::new(local.clone(), true));
        let (listener, address) = server.bind("127.0.0.1:0").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(server.run(listener, shutdown_rx));

        session
            .create(
                &format!("/t/replicas/{}/host", name),
                address.as_bytes(),
                CreateMode::Persistent,
            )
            .await
            .unwrap();
        session
            .create(
                &format!("/t/replicas/{}/is_active", name),
                b"",
                CreateMode::Ephemeral,
            )
            .await
            .unwrap();

        // Publish the parts the store already holds
        for meta in local.list_committed_parts().await.unwrap() {
            session
                .create(
                    &format!("/t/replicas/{}/parts/{}", name, meta.name),
                    b"",
                    CreateMode::Persistent,
                )
                .await
                .unwrap();
        }
        (session, shutdown_tx)
    }

    fn fetcher(local: Arc<MemoryStore>) -> Fetcher {
        Fetcher::new(
            TablePaths::new("/t"),
            "r2",
            local,
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_fetch_exact_part() {
        let coord = MemoryCoordination::new();
        let source_store = Arc::new(MemoryStore::new());
        commit(&source_store, "p_0_0_0", vec![json!({"id": 1})]).await;
        let (_session, _shutdown) = register_replica(&coord, "r1", source_store).await;

        let local = Arc::new(MemoryStore::new());
        let session = coord.session();
        session.ensure("/t/replicas/r2/parts").await.unwrap();

        let fetcher = fetcher(local.clone());
        let part = PartName::parse("p_0_0_0").unwrap();
        let installed = fetcher.fetch_part(session.as_ref(), &part).await.unwrap();
        assert_eq!(installed, part);

        assert!(local.contains(&part).await.unwrap());
        let block = local.read_block(&part).await.unwrap();
        assert_eq!(block.rows, vec![json!({"id": 1})]);
        assert!(session
            .exists("/t/replicas/r2/parts/p_0_0_0")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_fetch_resolves_to_covering_part() {
        let coord = MemoryCoordination::new();
        let source_store = Arc::new(MemoryStore::new());
        commit(
            &source_store,
            "p_0_5_1",
            vec![json!({"id": 1}), json!({"id": 2})],
        )
        .await;
        let (_session, _shutdown) = register_replica(&coord, "r1", source_store).await;

        let local = Arc::new(MemoryStore::new());
        let session = coord.session();
        session.ensure("/t/replicas/r2/parts").await.unwrap();

        let fetcher = fetcher(local.clone());
        let wanted = PartName::parse("p_2_2_0").unwrap();
        let installed = fetcher.fetch_part(session.as_ref(), &wanted).await.unwrap();
        assert_eq!(installed.to_string(), "p_0_5_1");
        assert!(local.contains(&installed).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_source_is_rejected_and_retried() {
        let coord = MemoryCoordination::new();

        // r1 serves corrupted bytes for the part
        let bad_store = Arc::new(MemoryStore::new());
        commit(&bad_store, "p_0_0_0", vec![json!({"id": 1})]).await;
        bad_store
            .tamper_part_file(
                &PartName::parse("p_0_0_0").unwrap(),
                "data.json",
                b"garbage".to_vec(),
            )
            .await
            .unwrap();
        let (_s1, _sh1) = register_replica(&coord, "r1", bad_store).await;

        let good_store = Arc::new(MemoryStore::new());
        commit(&good_store, "p_0_0_0", vec![json!({"id": 1})]).await;
        let (_s2, _sh2) = register_replica(&coord, "r3", good_store).await;

        let local = Arc::new(MemoryStore::new());
        let session = coord.session();
        session.ensure("/t/replicas/r2/parts").await.unwrap();

        let fetcher = fetcher(local.clone());
        let part = PartName::parse("p_0_0_0").unwrap();
        let installed = fetcher.fetch_part(session.as_ref(), &part).await.unwrap();
        assert_eq!(installed, part);
        let block = local.read_block(&part).await.unwrap();
        assert_eq!(block.rows, vec![json!({"id": 1})]);
    }

    #[tokio::test]
    async fn test_no_source_available() {
        let coord = MemoryCoordination::new();
        let session = coord.session();
        session.ensure("/t/replicas/r2/parts").await.unwrap();

        let fetcher = fetcher(Arc::new(MemoryStore::new()));
        let part = PartName::parse("p_0_0_0").unwrap();
        let err = fetcher.fetch_part(session.as_ref(), &part).await.unwrap_err();
        assert!(matches!(err, Error::NoSourceReplica(_)));
    }
}
