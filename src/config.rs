//! Transport configuration and default constants.
//!
//! Defaults mirror the measured values the transport was tuned with. Every
//! tunable can be overridden from the environment:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `UDMA_BUFF_LEN` | bytes per sub-channel region |
//! | `UDMA_SPLIT_SEND`, `UDMA_SPLIT_SIZE_SEND` | forced send pipeline depth and chunk size |
//! | `UDMA_SPLIT_RECV`, `UDMA_SPLIT_SIZE_RECV` | forced receive pipeline depth and chunk size |
//! | `UDMA_PACK_SEND_MAX`, `UDMA_PACK_RECV_MAX` | pack buffer capacity per direction |
//! | `UDMA_PACK_SEND_DIRECT`, `UDMA_PACK_RECV_DIRECT` | size above which packing is bypassed |
//! | `UDMA_TIMEOUT_US` | remote-side liveness bound in microseconds |
//! | `UDMA_DELAY_PEEK` | local polls between peeks at the outstanding remote call |
//!
//! Values that do not parse, or that would break the channel capacity
//! invariant, are rejected with a warning and the default is kept.

use std::time::Duration;

use crate::channel::ChannelLayout;
use crate::pack::{RECORD_HEADER_LEN, align8};
use crate::split::{SplitOverride, SplitSelector};

// =============================================================================
// Limits
// =============================================================================

/// Maximum number of accelerator processes tracked by one registry.
pub const UDMA_MAX_PROCS: usize = 8;

/// Maximum number of peers tracked by one registry.
pub const UDMA_MAX_PEERS: usize = 64;

/// Maximum pipeline depth; one mailbox word per slot.
pub const UDMA_MAX_SPLIT: usize = 64;

/// Maximum number of requests in one receive-pack batch.
pub const UDMA_MAX_RECV_PACK: usize = 4096;

/// Housekeeping words stored after the mailbox array.
pub const MAILBOX_HOUSEKEEPING_WORDS: usize = 2;

// =============================================================================
// Defaults
// =============================================================================

/// Default size of one sub-channel region (64 MiB).
pub const DEFAULT_BUFF_LEN: usize = 64 * 1024 * 1024;

/// Default send pack buffer capacity (1 MiB).
pub const DEFAULT_PACK_SEND_MAX: usize = 1024 * 1024;

/// Default receive pack buffer capacity (1 MiB).
pub const DEFAULT_PACK_RECV_MAX: usize = 1024 * 1024;

/// Records larger than this bypass the send pack buffer (256 KiB).
pub const DEFAULT_PACK_SEND_DIRECT: usize = 256 * 1024;

/// Requests larger than this bypass the receive pack list (256 KiB).
pub const DEFAULT_PACK_RECV_DIRECT: usize = 256 * 1024;

/// Remote liveness bound (10 s).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Local mailbox polls between peeks at the outstanding remote call.
pub const DEFAULT_DELAY_PEEK: u32 = 1;

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdmaConfig {
    /// Bytes per sub-channel region (mailboxes included).
    pub buff_len: usize,
    /// Forced send split, replacing the tuning table.
    pub send_override: Option<SplitOverride>,
    /// Forced receive split, replacing the tuning table.
    pub recv_override: Option<SplitOverride>,
    /// Send pack buffer capacity in bytes.
    pub pack_send_max: usize,
    /// Receive pack buffer capacity in bytes.
    pub pack_recv_max: usize,
    /// Records above this many bytes are sent directly.
    pub pack_send_direct: usize,
    /// Requests above this many bytes are received directly.
    pub pack_recv_direct: usize,
    /// Remote-side liveness bound.
    pub timeout: Duration,
    /// Local mailbox polls between peeks at the outstanding remote call.
    pub delay_peek: u32,
}

impl Default for UdmaConfig {
    fn default() -> Self {
        Self {
            buff_len: DEFAULT_BUFF_LEN,
            send_override: None,
            recv_override: None,
            pack_send_max: DEFAULT_PACK_SEND_MAX,
            pack_recv_max: DEFAULT_PACK_RECV_MAX,
            pack_send_direct: DEFAULT_PACK_SEND_DIRECT,
            pack_recv_direct: DEFAULT_PACK_RECV_DIRECT,
            timeout: DEFAULT_TIMEOUT,
            delay_peek: DEFAULT_DELAY_PEEK,
        }
    }
}

impl UdmaConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Used by [`from_env`](Self::from_env); tests pass a map instead of
    /// mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(len) = parse_var::<usize>(&lookup, "UDMA_BUFF_LEN") {
            match ChannelLayout::new(len, UDMA_MAX_SPLIT).and_then(SplitSelector::new) {
                Ok(_) => config.buff_len = len,
                Err(e) => tracing::warn!("ignoring UDMA_BUFF_LEN={}: {}", len, e),
            }
        }

        if let Ok(layout) = config.layout() {
            config.send_override =
                parse_override(&lookup, "UDMA_SPLIT_SEND", "UDMA_SPLIT_SIZE_SEND", &layout);
            config.recv_override =
                parse_override(&lookup, "UDMA_SPLIT_RECV", "UDMA_SPLIT_SIZE_RECV", &layout);
        }

        if let Some(v) = parse_var::<usize>(&lookup, "UDMA_PACK_SEND_MAX") {
            config.pack_send_max = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, "UDMA_PACK_RECV_MAX") {
            config.pack_recv_max = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, "UDMA_PACK_SEND_DIRECT") {
            config.pack_send_direct = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, "UDMA_PACK_RECV_DIRECT") {
            config.pack_recv_direct = v;
        }
        if let Err(e) = config.validate_packing() {
            tracing::warn!("ignoring pack overrides: {}", e);
            let defaults = Self::default();
            config.pack_send_max = defaults.pack_send_max;
            config.pack_recv_max = defaults.pack_recv_max;
            config.pack_send_direct = defaults.pack_send_direct;
            config.pack_recv_direct = defaults.pack_recv_direct;
        }

        if let Some(us) = parse_var::<u64>(&lookup, "UDMA_TIMEOUT_US") {
            if us == 0 {
                tracing::warn!("ignoring UDMA_TIMEOUT_US=0");
            } else {
                config.timeout = Duration::from_micros(us);
            }
        }
        if let Some(n) = parse_var::<u32>(&lookup, "UDMA_DELAY_PEEK") {
            config.delay_peek = n.max(1);
        }

        config
    }

    /// Layout of one sub-channel under this configuration.
    pub fn layout(&self) -> crate::Result<ChannelLayout> {
        ChannelLayout::new(self.buff_len, UDMA_MAX_SPLIT)
    }

    /// Check every invariant the transport relies on.
    pub fn validate(&self) -> crate::Result<()> {
        let layout = self.layout()?;
        SplitSelector::new(layout)?;
        for plan in [self.send_override, self.recv_override].into_iter().flatten() {
            plan.validate(&layout)?;
        }
        self.validate_packing()?;
        if self.timeout.is_zero() {
            return Err(crate::Error::ConfigInvalid("timeout must be non-zero".into()));
        }
        Ok(())
    }

    fn validate_packing(&self) -> crate::Result<()> {
        let room = self.pack_send_max.saturating_sub(RECORD_HEADER_LEN);
        if self.pack_send_direct > room || align8(self.pack_send_direct) > room {
            return Err(crate::Error::ConfigInvalid(format!(
                "a record at the send direct threshold {} exceeds pack capacity {}",
                self.pack_send_direct, self.pack_send_max
            )));
        }
        if self.pack_recv_direct > self.pack_recv_max {
            return Err(crate::Error::ConfigInvalid(format!(
                "receive direct threshold {} exceeds pack capacity {}",
                self.pack_recv_direct, self.pack_recv_max
            )));
        }
        Ok(())
    }

    /// Set the sub-channel region size.
    pub fn with_buff_len(mut self, buff_len: usize) -> Self {
        self.buff_len = buff_len;
        self
    }

    /// Set the remote liveness bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Force the send split.
    pub fn with_send_override(mut self, plan: SplitOverride) -> Self {
        self.send_override = Some(plan);
        self
    }

    /// Force the receive split.
    pub fn with_recv_override(mut self, plan: SplitOverride) -> Self {
        self.recv_override = Some(plan);
        self
    }

    /// Set the send pack capacity and direct-send threshold.
    pub fn with_send_packing(mut self, max: usize, direct: usize) -> Self {
        self.pack_send_max = max;
        self.pack_send_direct = direct;
        self
    }

    /// Set the receive pack capacity and direct-receive threshold.
    pub fn with_recv_packing(mut self, max: usize, direct: usize) -> Self {
        self.pack_recv_max = max;
        self.pack_recv_direct = direct;
        self
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

fn parse_override(
    lookup: &impl Fn(&str) -> Option<String>,
    split_key: &str,
    size_key: &str,
    layout: &ChannelLayout,
) -> Option<SplitOverride> {
    let split = parse_var::<usize>(lookup, split_key)?;
    let Some(chunk_size) = parse_var::<usize>(lookup, size_key) else {
        tracing::warn!("ignoring {}: {} is not set", split_key, size_key);
        return None;
    };
    let plan = SplitOverride { split, chunk_size };
    match plan.validate(layout) {
        Ok(()) => Some(plan),
        Err(e) => {
            tracing::warn!("ignoring {}/{}: {}", split_key, size_key, e);
            None
        }
    }
}
