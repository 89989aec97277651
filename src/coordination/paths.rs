//! Coordination Tree Layout
//!
//! Canonical placement of everything the table keeps in the coordination
//! service:
//!
//! ```text
//! <root>/metadata                      table metadata + version
//! <root>/log/log-<seq>                 shared replication log
//! <root>/replicas/<name>/is_active     ephemeral liveness tag
//! <root>/replicas/<name>/host          part exchange address
//! <root>/replicas/<name>/log_pointer   next log index to pull
//! <root>/replicas/<name>/queue/queue-<seq>
//! <root>/replicas/<name>/parts/<part>
//! <root>/leader_election/n-<seq>       ephemeral election nodes
//! <root>/blocks/<partition>/<hash>     dedup ledger
//! <root>/block_numbers/<partition>/block-<seq>
//! <root>/quorum/status                 in-flight quorum write
//! <root>/quorum/last_part              last quorum-satisfied part
//! <root>/mutations/mutation-<seq>
//! ```

/// Path builder for one table's coordination tree
#[derive(Debug, Clone)]
pub struct TablePaths {
    root: String,
}

impl TablePaths {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn metadata(&self) -> String {
        format!("{}/metadata", self.root)
    }

    pub fn log_dir(&self) -> String {
        format!("{}/log", self.root)
    }

    pub fn log_entry_prefix(&self) -> String {
        format!("{}/log/log-", self.root)
    }

    pub fn log_entry(&self, node: &str) -> String {
        format!("{}/log/{}", self.root, node)
    }

    pub fn replicas_dir(&self) -> String {
        format!("{}/replicas", self.root)
    }

    pub fn replica(&self, name: &str) -> String {
        format!("{}/replicas/{}", self.root, name)
    }

    pub fn is_active(&self, name: &str) -> String {
        format!("{}/replicas/{}/is_active", self.root, name)
    }

    pub fn host(&self, name: &str) -> String {
        format!("{}/replicas/{}/host", self.root, name)
    }

    pub fn log_pointer(&self, name: &str) -> String {
        format!("{}/replicas/{}/log_pointer", self.root, name)
    }

    pub fn metadata_version(&self, name: &str) -> String {
        format!("{}/replicas/{}/metadata_version", self.root, name)
    }

    pub fn queue_dir(&self, name: &str) -> String {
        format!("{}/replicas/{}/queue", self.root, name)
    }

    pub fn queue_entry_prefix(&self, name: &str) -> String {
        format!("{}/replicas/{}/queue/queue-", self.root, name)
    }

    pub fn queue_entry(&self, name: &str, node: &str) -> String {
        format!("{}/replicas/{}/queue/{}", self.root, name, node)
    }

    pub fn parts_dir(&self, name: &str) -> String {
        format!("{}/replicas/{}/parts", self.root, name)
    }

    pub fn part(&self, name: &str, part: &str) -> String {
        format!("{}/replicas/{}/parts/{}", self.root, name, part)
    }

    pub fn leader_election_dir(&self) -> String {
        format!("{}/leader_election", self.root)
    }

    pub fn leader_election_prefix(&self) -> String {
        format!("{}/leader_election/n-", self.root)
    }

    pub fn blocks_dir(&self) -> String {
        format!("{}/blocks", self.root)
    }

    pub fn blocks_partition(&self, partition: &str) -> String {
        format!("{}/blocks/{}", self.root, partition)
    }

    pub fn block(&self, partition: &str, hash: &str) -> String {
        format!("{}/blocks/{}/{}", self.root, partition, hash)
    }

    pub fn block_numbers_dir(&self) -> String {
        format!("{}/block_numbers", self.root)
    }

    pub fn block_numbers_partition(&self, partition: &str) -> String {
        format!("{}/block_numbers/{}", self.root, partition)
    }

    pub fn block_number_prefix(&self, partition: &str) -> String {
        format!("{}/block_numbers/{}/block-", self.root, partition)
    }

    pub fn quorum_dir(&self) -> String {
        format!("{}/quorum", self.root)
    }

    pub fn quorum_status(&self) -> String {
        format!("{}/quorum/status", self.root)
    }

    pub fn quorum_last_part(&self) -> String {
        format!("{}/quorum/last_part", self.root)
    }

    pub fn mutations_dir(&self) -> String {
        format!("{}/mutations", self.root)
    }

    pub fn mutation_prefix(&self) -> String {
        format!("{}/mutations/mutation-", self.root)
    }

    pub fn mutation(&self, node: &str) -> String {
        format!("{}/mutations/{}", self.root, node)
    }
}
