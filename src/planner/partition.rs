use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::scheduler::job::SourceRef;

/// Half-open byte range `[start, end)` within a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PartitionKind {
    /// Scans one slice of the source through the connector.
    Scan,
    /// Aggregates the payloads of all scan partitions of the job.
    Merge,
}

/// One schedulable slice of a source's scannable surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub index: u32,
    pub kind: PartitionKind,
    /// Byte range covered by a scan partition. `None` means the whole
    /// source (size unknown) or a merge partition.
    pub range: Option<ByteRange>,
}

impl PartitionSpec {
    pub fn whole_source() -> Self {
        Self {
            index: 0,
            kind: PartitionKind::Scan,
            range: None,
        }
    }

    pub fn scan(index: u32, start: u64, end: u64) -> Self {
        Self {
            index,
            kind: PartitionKind::Scan,
            range: Some(ByteRange { start, end }),
        }
    }

    pub fn merge(index: u32) -> Self {
        Self {
            index,
            kind: PartitionKind::Merge,
            range: None,
        }
    }

    /// Bytes this partition covers, for resource estimation.
    pub fn size_hint(&self) -> u64 {
        self.range.map(|r| r.len()).unwrap_or(0)
    }
}

/// Capability interface for splitting a source's scannable surface into
/// partitions. Implementations are supplied per source family; the engine
/// only requires the result to be non-empty.
pub trait Partitioner: Send + Sync {
    fn partition(&self, source: &SourceRef) -> Result<Vec<PartitionSpec>>;
}

/// Splits a source into fixed-width byte ranges. Sources without a size
/// hint become a single whole-source partition.
#[derive(Debug, Clone)]
pub struct UniformPartitioner {
    pub partition_bytes: u64,
}

impl Default for UniformPartitioner {
    fn default() -> Self {
        Self {
            partition_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Partitioner for UniformPartitioner {
    fn partition(&self, source: &SourceRef) -> Result<Vec<PartitionSpec>> {
        if self.partition_bytes == 0 {
            return Err(ScanError::InvalidRequest(
                "partition width must be positive".to_string(),
            ));
        }
        let bytes = match source.bytes {
            None | Some(0) => return Ok(vec![PartitionSpec::whole_source()]),
            Some(bytes) => bytes,
        };

        let mut partitions = Vec::new();
        let mut start = 0u64;
        let mut index = 0u32;
        while start < bytes {
            let end = (start + self.partition_bytes).min(bytes);
            partitions.push(PartitionSpec::scan(index, start, end));
            start = end;
            index += 1;
        }
        Ok(partitions)
    }
}
