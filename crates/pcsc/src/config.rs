//! Configuration options for the client and the readers it creates

use crate::driver::{Disposition, Protocol, ShareMode};

/// What to do when a reader name that already went away is reported again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplugPolicy {
    /// Ignore every later event for the name (default)
    #[default]
    Discard,
    /// Create a fresh reader and announce it again
    Recreate,
}

/// Configuration options shared by every reader of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Sharing mode for card connections
    pub share_mode: ShareMode,

    /// Protocol to request on connect, `None` lets the driver negotiate
    pub protocol: Option<Protocol>,

    /// Disposition used when the lifecycle tears a card down
    pub teardown: Disposition,

    /// Handling of reader names seen again after going away
    pub replug: ReplugPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConfig {
    /// Create a new default configuration
    pub const fn new() -> Self {
        Self {
            share_mode: ShareMode::Shared,
            protocol: None,
            teardown: Disposition::Reset,
            replug: ReplugPolicy::Discard,
        }
    }

    /// Set the sharing mode
    pub const fn with_share_mode(mut self, mode: ShareMode) -> Self {
        self.share_mode = mode;
        self
    }

    /// Set the preferred protocol
    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Set the disposition used for lifecycle teardown
    pub const fn with_teardown(mut self, disposition: Disposition) -> Self {
        self.teardown = disposition;
        self
    }

    /// Set the replug policy
    pub const fn with_replug_policy(mut self, policy: ReplugPolicy) -> Self {
        self.replug = policy;
        self
    }
}
