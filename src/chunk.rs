use std::fmt;

/// Inclusive block range `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn len(&self) -> u64 {
        self.to.saturating_sub(self.from).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.from > self.to
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// First block still to be processed: `max(checkpoint + 1, start_block)`.
/// No checkpoint behaves as `start_block - 1`.
pub fn next_block(checkpoint: Option<u64>, start_block: u64) -> u64 {
    match checkpoint {
        Some(last) => last.saturating_add(1).max(start_block),
        None => start_block,
    }
}

/// Split `[from, to]` into ascending, gap-free sub-ranges of at most
/// `max_width` blocks. Yields nothing when `from > to`.
pub fn chunk_range(from: u64, to: u64, max_width: u64) -> Chunks {
    Chunks {
        next: (from <= to).then_some(from),
        to,
        width: max_width.max(1),
    }
}

#[derive(Debug, Clone)]
pub struct Chunks {
    next: Option<u64>,
    to: u64,
    width: u64,
}

impl Iterator for Chunks {
    type Item = BlockRange;

    fn next(&mut self) -> Option<BlockRange> {
        let from = self.next?;
        let end = from.saturating_add(self.width - 1).min(self.to);
        self.next = if end == self.to { None } else { Some(end + 1) };
        Some(BlockRange::new(from, end))
    }
}
