use std::fmt;

/// Lifecycle state of a worker channel.
///
/// ```text
/// Created ─► Initializing ─► Initialized ─► LoadingFunctions ─► Ready
///                                                 ▲               │
///                                                 └───────────────┤
///                                          Restarting ◄───────────┤
///                                            Disposed ◄───────────┘ (from any state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Created,
    Initializing,
    Initialized,
    LoadingFunctions,
    Ready,
    Restarting,
    Disposed,
}

impl ChannelState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::LoadingFunctions => "loading_functions",
            Self::Ready => "ready",
            Self::Restarting => "restarting",
            Self::Disposed => "disposed",
        }
    }

    /// True once the channel can no longer serve traffic.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Restarting | Self::Disposed)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
