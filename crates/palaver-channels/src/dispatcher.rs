use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use palaver_core::config::DispatchConfig;
use palaver_core::{ConversationId, Platform};
use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::{
    client::PlatformClient,
    error::SendError,
    types::{ChannelStatus, OutboundMessage, SessionTarget},
};

/// Jitter fraction applied to each delay (±10 %).
const JITTER_FRACTION: f64 = 0.10;

/// Bounded exponential backoff for transient send failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Nominal delay before retry number `attempt` (1-based), without jitter.
    ///
    /// Schedule: base → 2·base → 4·base → … capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms)
    }
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(cfg: &DispatchConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay_ms: cfg.base_delay_ms,
            max_delay_ms: cfg.max_delay_ms.max(cfg.base_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

/// Routes outbound responses to platform clients.
///
/// Clients are registered at startup and keyed by [`PlatformClient::platform`].
/// A conversation may additionally be bound to mirror sessions on other
/// platforms; `send` then fans the response out to every bound session.
pub struct PlatformDispatcher {
    clients: HashMap<Platform, Arc<dyn PlatformClient>>,
    mirrors: DashMap<SessionTarget, Vec<SessionTarget>>,
    policy: RetryPolicy,
}

impl PlatformDispatcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            clients: HashMap::new(),
            mirrors: DashMap::new(),
            policy,
        }
    }

    pub fn from_config(cfg: &DispatchConfig) -> Self {
        Self::new(RetryPolicy::from(cfg))
    }

    /// Register a platform client. A client with the same platform is replaced.
    pub fn register(&mut self, client: Arc<dyn PlatformClient>) {
        let platform = client.platform();
        info!(platform = %platform, "registering platform client");
        self.clients.insert(platform, client);
    }

    pub fn has_platform(&self, platform: &Platform) -> bool {
        self.clients.contains_key(platform)
    }

    /// Mirror every response for `primary` to `mirror` as well.
    pub fn bind(&self, primary: SessionTarget, mirror: SessionTarget) {
        if primary == mirror {
            return;
        }
        let mut entry = self.mirrors.entry(primary).or_default();
        if !entry.contains(&mirror) {
            entry.push(mirror);
        }
    }

    /// Drop all mirror bindings of `primary`.
    pub fn unbind(&self, primary: &SessionTarget) {
        self.mirrors.remove(primary);
    }

    /// The sessions a response for `primary` is delivered to, primary first.
    pub fn targets(&self, primary: &SessionTarget) -> Vec<SessionTarget> {
        let mut targets = vec![primary.clone()];
        if let Some(mirrors) = self.mirrors.get(primary) {
            targets.extend(mirrors.iter().cloned());
        }
        targets
    }

    /// Deliver `msg` to the conversation and every session mirroring it.
    ///
    /// Every target is attempted even if an earlier one fails; the first
    /// error is returned after all attempts.
    pub async fn send(
        &self,
        platform: &Platform,
        conversation: &ConversationId,
        msg: &OutboundMessage,
    ) -> Result<(), SendError> {
        let primary = SessionTarget::new(platform.clone(), conversation.clone());
        let mut first_err = None;

        for target in self.targets(&primary) {
            if let Err(e) = self.send_one(&target, msg).await {
                error!(target = %target, error = %e, "dropping outbound message");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Deliver to exactly one session with retry and backoff.
    pub async fn send_one(&self, target: &SessionTarget, msg: &OutboundMessage) -> Result<(), SendError> {
        let client = self
            .clients
            .get(&target.platform)
            .ok_or_else(|| SendError::UnknownPlatform(target.platform.to_string()))?;

        send_with_backoff(client.as_ref(), target, msg, self.policy).await
    }

    /// Current [`ChannelStatus`] of every client, sorted by platform.
    pub fn statuses(&self) -> Vec<(Platform, ChannelStatus)> {
        let mut result: Vec<(Platform, ChannelStatus)> = self
            .clients
            .iter()
            .map(|(p, c)| (p.clone(), c.status()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}

impl Default for PlatformDispatcher {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

async fn send_with_backoff(
    client: &dyn PlatformClient,
    target: &SessionTarget,
    msg: &OutboundMessage,
    policy: RetryPolicy,
) -> Result<(), SendError> {
    let mut attempt = 1;

    loop {
        match client.send(&target.conversation_id, msg).await {
            Ok(()) => {
                debug!(target = %target, attempt, "message delivered");
                return Ok(());
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                return Err(SendError::Exhausted {
                    attempts: attempt,
                    last: e.to_string(),
                });
            }
            Err(e) => {
                let base = policy.delay_for(attempt);
                let total = with_jitter(base);
                warn!(
                    target = %target,
                    attempt,
                    max = policy.max_attempts,
                    error = %e,
                    retry_after_ms = total,
                    "send failed, retrying with backoff"
                );
                sleep(Duration::from_millis(total)).await;
                attempt += 1;
            }
        }
    }
}

/// `base_ms` moved by a random offset of up to `JITTER_FRACTION` either way.
fn with_jitter(base_ms: u64) -> u64 {
    let spread = ((base_ms as f64) * JITTER_FRACTION) as i64;
    if spread == 0 {
        return base_ms;
    }
    let offset = rand::rng().random_range(-spread..=spread);
    base_ms.saturating_add_signed(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` sends with `err`, then succeeds.
    struct Flaky {
        platform: &'static str,
        failures: u32,
        err: SendError,
        calls: AtomicU32,
        delivered: Mutex<Vec<(String, String)>>,
    }

    impl Flaky {
        fn new(platform: &'static str, failures: u32, err: SendError) -> Arc<Self> {
            Arc::new(Self {
                platform,
                failures,
                err,
                calls: AtomicU32::new(0),
                delivered: Mutex::new(Vec::new()),
            })
        }

        fn ok(platform: &'static str) -> Arc<Self> {
            Self::new(platform, 0, SendError::Transient("unused".into()))
        }
    }

    #[async_trait]
    impl PlatformClient for Flaky {
        fn platform(&self) -> Platform {
            Platform::from(self.platform)
        }

        async fn send(&self, conversation: &ConversationId, msg: &OutboundMessage) -> Result<(), SendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(self.err.clone());
            }
            self.delivered
                .lock()
                .unwrap()
                .push((conversation.to_string(), msg.content.clone()));
            Ok(())
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    fn dispatcher(policy: RetryPolicy, clients: &[Arc<Flaky>]) -> PlatformDispatcher {
        let mut d = PlatformDispatcher::new(policy);
        for c in clients {
            d.register(c.clone());
        }
        d
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 250,
            max_delay_ms: 1000,
        };
        assert_eq!(p.delay_for(1), 250);
        assert_eq!(p.delay_for(2), 500);
        assert_eq!(p.delay_for(3), 1000);
        assert_eq!(p.delay_for(9), 1000);
    }

    #[test]
    fn jitter_stays_within_ten_percent_both_ways() {
        let samples: Vec<u64> = (0..200).map(|_| with_jitter(1000)).collect();
        assert!(samples.iter().all(|d| (900..=1100).contains(d)));
        assert!(samples.iter().any(|d| *d < 1000));
        assert!(samples.iter().any(|d| *d > 1000));
        assert_eq!(with_jitter(5), 5);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let client = Flaky::new("telnet", 2, SendError::Transient("reset".into()));
        let d = dispatcher(fast(4), &[client.clone()]);
        d.send(&"telnet".into(), &"r1".into(), &OutboundMessage::text("hi"))
            .await
            .unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert_eq!(client.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempts() {
        let client = Flaky::new("telnet", 10, SendError::Timeout { ms: 5 });
        let d = dispatcher(fast(3), &[client.clone()]);
        let err = d
            .send(&"telnet".into(), &"r1".into(), &OutboundMessage::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Exhausted { attempts: 3, .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let client = Flaky::new(
            "telnet",
            10,
            SendError::InvalidSession {
                platform: "telnet".into(),
                conversation: "gone".into(),
            },
        );
        let d = dispatcher(fast(5), &[client.clone()]);
        let err = d
            .send(&"telnet".into(), &"gone".into(), &OutboundMessage::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::InvalidSession { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_platform_fails_immediately() {
        let d = PlatformDispatcher::new(fast(3));
        let err = d
            .send(&"irc".into(), &"r1".into(), &OutboundMessage::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::UnknownPlatform(_)));
    }

    #[tokio::test]
    async fn fan_out_reaches_every_bound_session() {
        let telnet = Flaky::ok("telnet");
        let chat = Flaky::ok("chat");
        let d = dispatcher(fast(2), &[telnet.clone(), chat.clone()]);
        d.bind(SessionTarget::new("telnet", "r1"), SessionTarget::new("chat", "room-9"));

        d.send(&"telnet".into(), &"r1".into(), &OutboundMessage::text("hello"))
            .await
            .unwrap();

        assert_eq!(telnet.delivered.lock().unwrap()[0], ("r1".to_string(), "hello".to_string()));
        assert_eq!(chat.delivered.lock().unwrap()[0], ("room-9".to_string(), "hello".to_string()));
    }

    #[tokio::test]
    async fn fan_out_attempts_all_targets_and_returns_first_error() {
        let broken = Flaky::new("telnet", 10, SendError::Rejected("nope".into()));
        let chat = Flaky::ok("chat");
        let d = dispatcher(fast(2), &[broken.clone(), chat.clone()]);
        d.bind(SessionTarget::new("telnet", "r1"), SessionTarget::new("chat", "room-9"));

        let err = d
            .send(&"telnet".into(), &"r1".into(), &OutboundMessage::text("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Rejected(_)));
        assert_eq!(chat.delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn binding_is_deduplicated_and_removable() {
        let d = PlatformDispatcher::default();
        let primary = SessionTarget::new("telnet", "r1");
        d.bind(primary.clone(), SessionTarget::new("chat", "x"));
        d.bind(primary.clone(), SessionTarget::new("chat", "x"));
        d.bind(primary.clone(), primary.clone());
        assert_eq!(d.targets(&primary).len(), 2);
        d.unbind(&primary);
        assert_eq!(d.targets(&primary), vec![primary]);
    }

    #[tokio::test]
    async fn empty_message_is_still_delivered() {
        let client = Flaky::ok("telnet");
        let d = dispatcher(fast(1), &[client.clone()]);
        d.send(&"telnet".into(), &"r1".into(), &OutboundMessage::text(""))
            .await
            .unwrap();
        assert_eq!(client.delivered.lock().unwrap()[0].1, "");
    }
}
