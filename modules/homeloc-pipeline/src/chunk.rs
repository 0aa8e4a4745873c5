use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use homeloc_common::PipelineError;

/// Slice `i` of `M` (1-indexed) of an ordered user list.
///
/// Boundaries depend only on the list length and `(index, count)`: the first
/// `len % count` chunks get one extra element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub index: usize,
    pub count: usize,
}

impl ChunkSpec {
    pub fn new(index: usize, count: usize) -> Result<Self, PipelineError> {
        if count == 0 || index == 0 || index > count {
            return Err(PipelineError::InvalidChunk { index, count });
        }
        Ok(Self { index, count })
    }

    pub fn range(&self, len: usize) -> Range<usize> {
        let size = len / self.count;
        let remainder = len % self.count;
        let i = self.index - 1;
        let start = i * size + i.min(remainder);
        let end = start + size + usize::from(i < remainder);
        start..end
    }

    pub fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        &items[self.range(items.len())]
    }

    /// Every chunk of a `count`-way split.
    pub fn all(count: usize) -> Result<Vec<ChunkSpec>, PipelineError> {
        if count == 0 {
            return Err(PipelineError::InvalidChunk { index: 0, count });
        }
        (1..=count).map(|i| ChunkSpec::new(i, count)).collect()
    }
}

impl fmt::Display for ChunkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

impl FromStr for ChunkSpec {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PipelineError::Config(format!("chunk must look like 2/5, got {s:?}"));
        let (i, m) = s.split_once('/').ok_or_else(invalid)?;
        let index = i.trim().parse().map_err(|_| invalid())?;
        let count = m.trim().parse().map_err(|_| invalid())?;
        ChunkSpec::new(index, count)
    }
}
