use std::sync::Arc;
use std::time::Duration;

use crate::calls::media::AudioRouter;

/// What to do with a call request that arrives while another call is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyPolicy {
    /// Answer the requester with `call-rejected`.
    #[default]
    Reject,
    /// Drop the request without telling the requester.
    Ignore,
}

/// Configuration for the call manager.
#[derive(Clone)]
pub struct CallConfig {
    /// STUN servers handed to the peer session. No TURN relays.
    pub stun_servers: Vec<String>,
    /// How long a call may ring (either direction) before it is ended.
    pub ring_timeout: Option<Duration>,
    pub busy_policy: BusyPolicy,
    /// Buffer size of the call event broadcast channel.
    pub event_capacity: usize,
    /// Keep mDNS host candidates (useful when debugging on a LAN).
    pub ice_debug: bool,
    /// System audio routing. Defaults to a router that only logs.
    pub audio_router: Option<Arc<dyn AudioRouter>>,
}

impl std::fmt::Debug for CallConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallConfig")
            .field("stun_servers", &self.stun_servers)
            .field("ring_timeout", &self.ring_timeout)
            .field("busy_policy", &self.busy_policy)
            .field("event_capacity", &self.event_capacity)
            .field("ice_debug", &self.ice_debug)
            .field("audio_router", &self.audio_router.is_some())
            .finish()
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            ring_timeout: Some(Duration::from_secs(45)),
            busy_policy: BusyPolicy::default(),
            event_capacity: 100,
            ice_debug: false,
            audio_router: None,
        }
    }
}

impl CallConfig {
    pub fn with_stun_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_servers = servers;
        self
    }

    pub fn with_ring_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ring_timeout = timeout;
        self
    }

    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    pub fn with_audio_router(mut self, router: Arc<dyn AudioRouter>) -> Self {
        self.audio_router = Some(router);
        self
    }
}
