//! Partition planning over an inclusive integer key domain.
//!
//! A planner takes the eligible-row bounds `[min, max]` and a grid size and
//! returns disjoint, gapless ranges. An empty domain yields no partitions.

use forgebatch_core::ExecutionContext;
use serde::{Deserialize, Serialize};

use crate::item::ItemError;
use crate::step::StepScope;

pub const MIN_ID_KEY: &str = "minId";
pub const MAX_ID_KEY: &str = "maxId";
const PARTITION_NAME_KEY: &str = "partition.name";
const PARTITION_INDEX_KEY: &str = "partition.index";

/// Inclusive key range `[lo, hi]`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub lo: i64,
    pub hi: i64,
}

impl KeyRange {
    pub fn new(lo: i64, hi: i64) -> Self {
        Self { lo, hi }
    }

    /// Number of keys covered; zero when `hi < lo`.
    pub fn len(&self) -> u128 {
        if self.hi < self.lo {
            0
        } else {
            (self.hi as i128 - self.lo as i128 + 1) as u128
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hi < self.lo
    }

    pub fn contains(&self, key: i64) -> bool {
        self.lo <= key && key <= self.hi
    }
}

/// One unit of partitioned work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub index: usize,
    pub name: String,
    pub range: KeyRange,
}

impl Partition {
    pub fn new(index: usize, range: KeyRange) -> Self {
        Self {
            index,
            name: format!("partition{index}"),
            range,
        }
    }

    /// Context handed to the worker step for this partition.
    pub fn to_context(&self) -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.put_i64(MIN_ID_KEY, self.range.lo);
        ctx.put_i64(MAX_ID_KEY, self.range.hi);
        ctx.put_str(PARTITION_NAME_KEY, self.name.clone());
        ctx.put_u64(PARTITION_INDEX_KEY, self.index as u64);
        ctx
    }

    /// Rebuild a partition from a worker step's stored context.
    pub fn from_context(ctx: &ExecutionContext) -> Option<Self> {
        let lo = ctx.get_i64(MIN_ID_KEY)?;
        let hi = ctx.get_i64(MAX_ID_KEY)?;
        let index = ctx.get_u64(PARTITION_INDEX_KEY)? as usize;
        Some(Self::new(index, KeyRange::new(lo, hi)))
    }
}

/// Pluggable planning strategy, chosen per partitioned step.
pub trait PartitionStrategy: Send + Sync {
    fn plan(&self, domain: Option<KeyRange>, grid_size: usize) -> Vec<Partition>;
}

/// Splits the domain into `min(grid_size, keys)` ranges whose sizes differ by at most one.
#[derive(Debug, Default, Clone, Copy)]
pub struct BalancedPartitioner;

impl PartitionStrategy for BalancedPartitioner {
    fn plan(&self, domain: Option<KeyRange>, grid_size: usize) -> Vec<Partition> {
        let Some(domain) = domain.filter(|d| !d.is_empty()) else {
            return Vec::new();
        };
        if grid_size == 0 {
            return Vec::new();
        }

        let keys = domain.len();
        let count = keys.min(grid_size as u128);
        let base = keys / count;
        let remainder = keys % count;

        let mut partitions = Vec::with_capacity(count as usize);
        let mut next = domain.lo as i128;
        for i in 0..count {
            let size = base + u128::from(i < remainder);
            let hi = next + size as i128 - 1;
            partitions.push(Partition::new(
                i as usize,
                KeyRange::new(next as i64, hi as i64),
            ));
            next = hi + 1;
        }
        partitions
    }
}

/// Fixed stride `ceil(keys / grid_size)`; the last range is clamped to `max`
/// and ranges that would start past `max` are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct StridePartitioner;

impl PartitionStrategy for StridePartitioner {
    fn plan(&self, domain: Option<KeyRange>, grid_size: usize) -> Vec<Partition> {
        let Some(domain) = domain.filter(|d| !d.is_empty()) else {
            return Vec::new();
        };
        if grid_size == 0 {
            return Vec::new();
        }

        let keys = domain.len() as i128;
        let g = grid_size as i128;
        let stride = (keys + g - 1) / g;
        let (lo, hi) = (domain.lo as i128, domain.hi as i128);

        (0..g)
            .map_while(|i| {
                let start = lo + i * stride;
                if start > hi {
                    return None;
                }
                let end = (start + stride - 1).min(hi);
                Some(Partition::new(i as usize, KeyRange::new(start as i64, end as i64)))
            })
            .collect()
    }
}

/// Query for the eligible-row bounds a partitioned step plans over.
pub trait DomainBounds: Send + Sync {
    fn bounds(&self, scope: &StepScope) -> Result<Option<KeyRange>, ItemError>;
}

impl<F> DomainBounds for F
where
    F: Fn(&StepScope) -> Result<Option<KeyRange>, ItemError> + Send + Sync,
{
    fn bounds(&self, scope: &StepScope) -> Result<Option<KeyRange>, ItemError> {
        self(scope)
    }
}
