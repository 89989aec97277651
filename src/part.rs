//! Part Model
//!
//! Immutable storage units exchanged between replicas. A part covers a
//! contiguous block range within one partition; its name uniquely determines
//! byte-identical content, verified by checksums before acceptance.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Monotonically increasing per-partition block number
pub type BlockNumber = u64;

/// Part identity: `(partition_id, min_block, max_block, level, mutation)`.
///
/// Canonical text form: `<partition>_<min>_<max>_<level>` with an optional
/// trailing `_<mutation>` for mutated parts. Partition ids must not contain
/// underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartName {
    pub partition_id: String,
    pub min_block: BlockNumber,
    pub max_block: BlockNumber,
    pub level: u32,
    pub mutation: Option<u64>,
}

impl PartName {
    /// Name for a freshly inserted part holding a single block
    pub fn new_single(partition_id: impl Into<String>, block: BlockNumber) -> Self {
        Self {
            partition_id: partition_id.into(),
            min_block: block,
            max_block: block,
            level: 0,
            mutation: None,
        }
    }

    /// Name of the part produced by merging `parts` (must be non-empty,
    /// same partition, uniform mutation version)
    pub fn merged(parts: &[PartName]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| Error::Internal("merge of zero parts".into()))?;
        Ok(Self {
            partition_id: first.partition_id.clone(),
            min_block: parts.iter().map(|p| p.min_block).min().unwrap_or(first.min_block),
            max_block: parts.iter().map(|p| p.max_block).max().unwrap_or(first.max_block),
            level: parts.iter().map(|p| p.level).max().unwrap_or(0) + 1,
            mutation: first.mutation,
        })
    }

    /// Name of this part after applying a mutation version
    pub fn mutated(&self, version: u64) -> Self {
        Self {
            mutation: Some(version),
            ..self.clone()
        }
    }

    /// Parse from canonical text form
    pub fn parse(s: &str) -> Result<Self> {
        let tokens: Vec<&str> = s.split('_').collect();
        let invalid = || Error::InvalidPartName(s.to_string());

        match tokens.len() {
            4 | 5 => {
                let min_block = tokens[1].parse().map_err(|_| invalid())?;
                let max_block = tokens[2].parse().map_err(|_| invalid())?;
                let level = tokens[3].parse().map_err(|_| invalid())?;
                let mutation = match tokens.get(4) {
                    Some(t) => Some(t.parse().map_err(|_| invalid())?),
                    None => None,
                };
                if tokens[0].is_empty() || min_block > max_block {
                    return Err(invalid());
                }
                Ok(Self {
                    partition_id: tokens[0].to_string(),
                    min_block,
                    max_block,
                    level,
                    mutation,
                })
            }
            _ => Err(invalid()),
        }
    }

    /// Whether this part's range fully covers `other` (a part covers itself)
    pub fn covers(&self, other: &PartName) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.min_block
            && self.max_block >= other.max_block
    }

    /// Whether the block ranges of two parts intersect
    pub fn overlaps(&self, other: &PartName) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.max_block
            && other.min_block <= self.max_block
    }

    /// Whether a block number falls inside this part's range
    pub fn contains_block(&self, block: BlockNumber) -> bool {
        self.min_block <= block && block <= self.max_block
    }
}

impl fmt::Display for PartName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.partition_id, self.min_block, self.max_block, self.level
        )?;
        if let Some(m) = self.mutation {
            write!(f, "_{}", m)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for PartName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        PartName::parse(&s)
    }
}

impl From<PartName> for String {
    fn from(p: PartName) -> String {
        p.to_string()
    }
}

impl std::str::FromStr for PartName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PartName::parse(s)
    }
}

/// Part lifecycle state.
///
/// Temporary and PreCommitted parts are owned exclusively by the local store;
/// a part is shared with the replication engine once Committed and published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartState {
    Temporary,
    PreCommitted,
    Committed,
    Outdated,
    Removed,
}

/// Reduce a part set to the minimal subset where no kept part is covered by
/// another kept part. Used when seeding a new replica from its peers.
pub fn covering_set(mut parts: Vec<PartName>) -> Vec<PartName> {
    // Widest range first within a partition, so covered parts are seen later
    parts.sort_by(|a, b| {
        a.partition_id
            .cmp(&b.partition_id)
            .then(a.min_block.cmp(&b.min_block))
            .then(b.max_block.cmp(&a.max_block))
            .then(b.level.cmp(&a.level))
    });
    parts.dedup();

    let mut kept: Vec<PartName> = Vec::new();
    for part in parts {
        if !kept.iter().any(|k| k != &part && k.covers(&part)) {
            kept.push(part);
        }
    }
    kept
}

/// A block of rows destined for one partition. This is the unit of insertion
/// and deduplication; the row representation is opaque to the replication
/// engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub partition_id: String,
    pub rows: Vec<serde_json::Value>,
}

impl Block {
    pub fn new(partition_id: impl Into<String>, rows: Vec<serde_json::Value>) -> Self {
        Self {
            partition_id: partition_id.into(),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Content hash over the committed data; identical blocks always produce
    /// identical ids, which is what the dedup ledger keys on
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.partition_id.as_bytes());
        for row in &self.rows {
            // serde_json serializes object keys in map order, so the
            // serialization is stable for equal values
            hasher.update(row.to_string().as_bytes());
            hasher.update(b"\n");
        }
        hex(&hasher.finalize())
    }
}

/// Checksum of one file inside a part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    pub size: u64,
    pub crc32: u32,
}

/// Checksum manifest of a part, exchanged ahead of the files themselves
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChecksumManifest {
    pub files: BTreeMap<String, FileChecksum>,
}

impl ChecksumManifest {
    /// Verify one received file against the manifest
    pub fn verify_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let expected = self.files.get(name).ok_or_else(|| Error::PartMismatch {
            part: String::new(),
            source_replica: String::new(),
            reason: format!("unexpected file {}", name),
        })?;
        if expected.size != data.len() as u64 || expected.crc32 != crc32fast::hash(data) {
            return Err(Error::PartMismatch {
                part: String::new(),
                source_replica: String::new(),
                reason: format!("checksum mismatch in file {}", name),
            });
        }
        Ok(())
    }
}

/// The files making up one part, keyed by file name
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartFiles {
    pub files: BTreeMap<String, Vec<u8>>,
}

impl PartFiles {
    /// Materialize a block as part files
    pub fn from_block(block: &Block) -> Result<Self> {
        let mut files = BTreeMap::new();
        files.insert("data.json".to_string(), serde_json::to_vec(&block.rows)?);
        files.insert(
            "partition.txt".to_string(),
            block.partition_id.as_bytes().to_vec(),
        );
        files.insert("count.txt".to_string(), block.len().to_string().into_bytes());
        Ok(Self { files })
    }

    /// Reconstruct the block from part files
    pub fn to_block(&self) -> Result<Block> {
        let partition_id = self
            .files
            .get("partition.txt")
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or_else(|| Error::Internal("part is missing partition.txt".into()))?;
        let rows = self
            .files
            .get("data.json")
            .map(|b| serde_json::from_slice(b))
            .transpose()?
            .ok_or_else(|| Error::Internal("part is missing data.json".into()))?;
        Ok(Block { partition_id, rows })
    }

    pub fn checksums(&self) -> ChecksumManifest {
        ChecksumManifest {
            files: self
                .files
                .iter()
                .map(|(name, data)| {
                    (
                        name.clone(),
                        FileChecksum {
                            size: data.len() as u64,
                            crc32: crc32fast::hash(data),
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.len() as u64).sum()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
