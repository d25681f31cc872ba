//! Adaptive split-size selection.
//!
//! Pipeline depth and chunk size come from tables measured per direction.
//! A transfer uses the last row whose threshold is at or below its length;
//! shorter transfers use the first row. Both values can be forced per
//! direction, but a forced plan must fit the channel.

use crate::channel::ChannelLayout;
use crate::config::UdmaConfig;
use crate::error::{Error, Result};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Transfer direction, from the local role's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local to remote.
    Send,
    /// Remote to local.
    Recv,
}

impl Direction {
    /// Lowercase name for logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Recv => "recv",
        }
    }
}

/// One row of a tuning table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitRow {
    /// Smallest transfer length this row applies to.
    pub threshold: usize,
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Pipeline depth.
    pub split: usize,
}

const fn row(threshold: usize, chunk_size: usize, split: usize) -> SplitRow {
    SplitRow {
        threshold,
        chunk_size,
        split,
    }
}

/// Send table, from throughput measurements.
pub const SEND_TABLE: &[SplitRow] = &[
    row(512 * KIB, 512 * KIB, 1),
    row(MIB, 512 * KIB, 2),
    row(16 * MIB, MIB, 4),
    row(32 * MIB, 2 * MIB, 4),
    row(64 * MIB, 4 * MIB, 8),
];

/// Receive table. Derived from the measured curve, with split and chunk
/// size raised where needed so neither decreases from one row to the next.
pub const RECV_TABLE: &[SplitRow] = &[
    row(MIB, 256 * KIB, 4),
    row(4 * MIB, 256 * KIB, 8),
    row(8 * MIB, 256 * KIB, 16),
    row(16 * MIB, MIB, 16),
    row(64 * MIB, 2 * MIB, 16),
];

/// Pipeline shape of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPlan {
    /// Number of slots in flight.
    pub split: usize,
    /// Bytes per chunk.
    pub chunk_size: usize,
}

/// A forced `(split, chunk_size)` for one direction.
pub type SplitOverride = SplitPlan;

impl SplitPlan {
    /// Check that the plan fits `layout`.
    pub fn validate(&self, layout: &ChannelLayout) -> Result<()> {
        if self.split == 0 || self.split > layout.max_split() {
            return Err(Error::ConfigInvalid(format!(
                "split {} outside 1..={}",
                self.split,
                layout.max_split()
            )));
        }
        if self.chunk_size == 0 || self.chunk_size % 8 != 0 {
            return Err(Error::ConfigInvalid(format!(
                "chunk size {} must be a non-zero multiple of 8",
                self.chunk_size
            )));
        }
        let needed = self.split.checked_mul(self.chunk_size);
        if needed.is_none_or(|needed| needed > layout.data_len()) {
            return Err(Error::ConfigInvalid(format!(
                "split {} x chunk {} exceeds channel data area of {} bytes",
                self.split,
                self.chunk_size,
                layout.data_len()
            )));
        }
        Ok(())
    }

    /// Number of chunks a transfer of `len` bytes is cut into.
    pub fn chunks(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }
}

/// Chooses a [`SplitPlan`] per transfer.
#[derive(Debug, Clone)]
pub struct SplitSelector {
    layout: ChannelLayout,
    send: Vec<SplitRow>,
    recv: Vec<SplitRow>,
    send_override: Option<SplitPlan>,
    recv_override: Option<SplitPlan>,
}

impl SplitSelector {
    /// Selector over the measured tables for a channel of `layout`.
    ///
    /// Rows that do not fit the channel are dropped; longer transfers then
    /// use the largest row that fits.
    pub fn new(layout: ChannelLayout) -> Result<Self> {
        Self::with_tables(layout, SEND_TABLE, RECV_TABLE)
    }

    /// Selector over custom tables.
    pub fn with_tables(layout: ChannelLayout, send: &[SplitRow], recv: &[SplitRow]) -> Result<Self> {
        Ok(Self {
            send: fit_table(&layout, send, Direction::Send)?,
            recv: fit_table(&layout, recv, Direction::Recv)?,
            layout,
            send_override: None,
            recv_override: None,
        })
    }

    /// Selector for a configuration, overrides included.
    pub fn from_config(config: &UdmaConfig) -> Result<Self> {
        let mut selector = Self::new(config.layout()?)?;
        if let Some(plan) = config.send_override {
            selector = selector.with_override(Direction::Send, plan)?;
        }
        if let Some(plan) = config.recv_override {
            selector = selector.with_override(Direction::Recv, plan)?;
        }
        Ok(selector)
    }

    /// Force the plan for one direction.
    pub fn with_override(mut self, direction: Direction, plan: SplitPlan) -> Result<Self> {
        plan.validate(&self.layout)?;
        match direction {
            Direction::Send => self.send_override = Some(plan),
            Direction::Recv => self.recv_override = Some(plan),
        }
        Ok(self)
    }

    /// Plan for a transfer of `len` bytes.
    pub fn select(&self, direction: Direction, len: usize) -> SplitPlan {
        let (table, forced) = match direction {
            Direction::Send => (&self.send, self.send_override),
            Direction::Recv => (&self.recv, self.recv_override),
        };
        if let Some(plan) = forced {
            return plan;
        }
        let row = table
            .iter()
            .rev()
            .find(|row| row.threshold <= len)
            .unwrap_or(&table[0]);
        SplitPlan {
            split: row.split,
            chunk_size: row.chunk_size,
        }
    }

    /// Channel layout plans are checked against.
    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }
}

fn fit_table(layout: &ChannelLayout, table: &[SplitRow], direction: Direction) -> Result<Vec<SplitRow>> {
    for pair in table.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b.threshold <= a.threshold || b.chunk_size < a.chunk_size || b.split < a.split {
            return Err(Error::ConfigInvalid(format!(
                "{} table is not monotonic at threshold {}",
                direction.as_str(),
                b.threshold
            )));
        }
    }
    let rows: Vec<SplitRow> = table
        .iter()
        .copied()
        .take_while(|row| {
            SplitPlan {
                split: row.split,
                chunk_size: row.chunk_size,
            }
            .validate(layout)
            .is_ok()
        })
        .collect();
    if rows.is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "no {} table row fits a channel data area of {} bytes",
            direction.as_str(),
            layout.data_len()
        )));
    }
    if rows.len() < table.len() {
        tracing::debug!(
            "{} table truncated to {} rows for {} byte channels",
            direction.as_str(),
            rows.len(),
            layout.data_len()
        );
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_BUFF_LEN, UDMA_MAX_SPLIT};

    fn default_selector() -> SplitSelector {
        SplitSelector::new(ChannelLayout::new(DEFAULT_BUFF_LEN, UDMA_MAX_SPLIT).unwrap()).unwrap()
    }

    #[test]
    fn test_small_transfers_use_first_row() {
        let selector = default_selector();
        assert_eq!(
            selector.select(Direction::Send, 100),
            SplitPlan {
                split: 1,
                chunk_size: 512 * KIB
            }
        );
        assert_eq!(
            selector.select(Direction::Recv, 1),
            SplitPlan {
                split: 4,
                chunk_size: 256 * KIB
            }
        );
    }

    #[test]
    fn test_last_row_at_or_below_length_wins() {
        let selector = default_selector();
        assert_eq!(selector.select(Direction::Send, 16 * MIB).chunk_size, MIB);
        assert_eq!(selector.select(Direction::Send, 16 * MIB - 1).split, 2);
        assert_eq!(
            selector.select(Direction::Send, 1 << 40),
            SplitPlan {
                split: 8,
                chunk_size: 4 * MIB
            }
        );
    }

    #[test]
    fn test_selection_is_monotonic_and_fits() {
        let selector = default_selector();
        let data_len = selector.layout().data_len();
        for direction in [Direction::Send, Direction::Recv] {
            let mut prev = selector.select(direction, 0);
            let mut len = 1usize;
            while len <= 256 * MIB {
                for n in [len - 1, len, len + 1] {
                    let plan = selector.select(direction, n);
                    assert!(plan.split * plan.chunk_size <= data_len);
                    assert!(plan.split >= prev.split && plan.chunk_size >= prev.chunk_size);
                    prev = plan;
                }
                len *= 2;
            }
        }
    }

    #[test]
    fn test_default_tables_never_shrink() {
        for table in [SEND_TABLE, RECV_TABLE] {
            for pair in table.windows(2) {
                assert!(pair[0].threshold < pair[1].threshold);
                assert!(pair[0].split <= pair[1].split);
                assert!(pair[0].chunk_size <= pair[1].chunk_size);
            }
        }
    }

    #[test]
    fn test_override_must_fit() {
        let selector = default_selector();
        let forced = SplitPlan {
            split: 4,
            chunk_size: 2 * MIB,
        };
        let selector = selector.with_override(Direction::Send, forced).unwrap();
        assert_eq!(selector.select(Direction::Send, 1), forced);

        let too_big = SplitPlan {
            split: 64,
            chunk_size: MIB,
        };
        let err = selector.with_override(Direction::Recv, too_big).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn test_small_channels_truncate_tables() {
        let layout = ChannelLayout::new(4 * MIB, UDMA_MAX_SPLIT).unwrap();
        let selector = SplitSelector::new(layout).unwrap();
        assert_eq!(
            selector.select(Direction::Send, 100 * MIB),
            SplitPlan {
                split: 2,
                chunk_size: 512 * KIB
            }
        );
        assert_eq!(selector.select(Direction::Recv, 100 * MIB).split, 8);

        let tiny = ChannelLayout::new(64 * KIB, UDMA_MAX_SPLIT).unwrap();
        assert!(SplitSelector::new(tiny).is_err());
    }

    #[test]
    fn test_non_monotonic_table_is_rejected() {
        let layout = ChannelLayout::new(DEFAULT_BUFF_LEN, UDMA_MAX_SPLIT).unwrap();
        let bad = [row(MIB, MIB, 4), row(2 * MIB, 512 * KIB, 4)];
        assert!(SplitSelector::with_tables(layout, &bad, RECV_TABLE).is_err());
    }
}
