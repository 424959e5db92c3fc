//! Per-destination flood cooldowns, global dispatch pacing, and retry backoff.
//!
//! The governor never sleeps. It answers `before_send` with a wait instruction
//! and the dispatcher turns that into a reschedule.

use crate::types::ChatId;
use dashmap::DashMap;
use rand::RngExt;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    WaitFor(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloodState {
    pub cooldown_until: Instant,
    pub consecutive_hits: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FloodSnapshot {
    pub chat_id: ChatId,
    pub remaining_ms: u64,
    pub consecutive_hits: u32,
}

#[derive(Debug)]
pub struct RateGovernor {
    flood: DashMap<ChatId, FloodState>,
    global_min_interval: Duration,
    next_global_slot: Mutex<Option<Instant>>,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl RateGovernor {
    pub fn new(
        global_min_interval: Duration,
        backoff_base: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            flood: DashMap::new(),
            global_min_interval,
            next_global_slot: Mutex::new(None),
            backoff_base,
            backoff_max,
        }
    }

    /// Checks the destination cooldown, then reserves a global pacing slot.
    pub fn before_send(&self, chat_id: ChatId) -> Gate {
        let now = Instant::now();
        if let Some(remaining) = self.cooldown_remaining(chat_id, now) {
            return Gate::WaitFor(remaining);
        }
        if self.global_min_interval.is_zero() {
            return Gate::Proceed;
        }

        let mut slot = self
            .next_global_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *slot {
            Some(next) if next > now => Gate::WaitFor(next - now),
            _ => {
                *slot = Some(now + self.global_min_interval);
                Gate::Proceed
            }
        }
    }

    pub fn cooldown_remaining(&self, chat_id: ChatId, now: Instant) -> Option<Duration> {
        let state = self.flood.get(&chat_id)?;
        (state.cooldown_until > now).then(|| state.cooldown_until - now)
    }

    /// Records a flood-wait signal. Overlapping signals never shorten an
    /// active cooldown. Returns the instant the destination opens again.
    pub fn record_rate_limited(&self, chat_id: ChatId, retry_after: Duration) -> Instant {
        let until = Instant::now() + retry_after;
        let mut state = self.flood.entry(chat_id).or_insert(FloodState {
            cooldown_until: until,
            consecutive_hits: 0,
        });
        state.cooldown_until = state.cooldown_until.max(until);
        state.consecutive_hits = state.consecutive_hits.saturating_add(1);
        tracing::warn!(
            target_chat = %chat_id,
            ?retry_after,
            consecutive_hits = state.consecutive_hits,
            "destination rate limited"
        );
        state.cooldown_until
    }

    pub fn record_success(&self, chat_id: ChatId) {
        let now = Instant::now();
        // Expired states carry no information once the hit streak resets.
        self.flood
            .remove_if(&chat_id, |_, state| state.cooldown_until <= now);
        if let Some(mut state) = self.flood.get_mut(&chat_id) {
            state.consecutive_hits = 0;
        }
    }

    #[cfg(test)]
    fn flood_state(&self, chat_id: ChatId) -> Option<FloodState> {
        self.flood.get(&chat_id).map(|state| *state)
    }

    /// Upper bound of the retry delay: `base * 2^attempt`, capped.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let multiplier = 1_u32 << attempt.min(20);
        self.backoff_base
            .saturating_mul(multiplier)
            .min(self.backoff_max)
    }

    /// Full-jitter delay drawn uniformly from `[0, backoff_ceiling(attempt)]`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = self.backoff_ceiling(attempt).as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=ceiling_ms))
    }

    pub fn snapshot(&self) -> Vec<FloodSnapshot> {
        let now = Instant::now();
        let mut out: Vec<FloodSnapshot> = self
            .flood
            .iter()
            .filter(|entry| entry.value().cooldown_until > now)
            .map(|entry| FloodSnapshot {
                chat_id: *entry.key(),
                remaining_ms: (entry.value().cooldown_until - now).as_millis() as u64,
                consecutive_hits: entry.value().consecutive_hits,
            })
            .collect();
        out.sort_by_key(|snapshot| snapshot.chat_id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> RateGovernor {
        RateGovernor::new(
            Duration::ZERO,
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_blocks_only_the_limited_chat() {
        let governor = governor();
        let x = ChatId::new(1);
        let y = ChatId::new(2);

        governor.record_rate_limited(x, Duration::from_secs(5));
        assert_eq!(governor.before_send(x), Gate::WaitFor(Duration::from_secs(5)));
        assert_eq!(governor.before_send(y), Gate::Proceed);

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(matches!(governor.before_send(x), Gate::WaitFor(_)));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(governor.before_send(x), Gate::Proceed);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_hits() {
        let governor = governor();
        let chat = ChatId::new(9);
        governor.record_rate_limited(chat, Duration::from_secs(1));
        governor.record_rate_limited(chat, Duration::from_millis(10));
        let state = governor.flood_state(chat).expect("flood state");
        assert_eq!(state.consecutive_hits, 2);
        assert_eq!(
            governor.cooldown_remaining(chat, Instant::now()),
            Some(Duration::from_secs(1)),
            "a shorter signal must not shorten the active cooldown"
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        governor.record_success(chat);
        assert!(governor.flood_state(chat).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn global_pacing_spaces_dispatches() {
        let governor = RateGovernor::new(
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_secs(5),
        );
        assert_eq!(governor.before_send(ChatId::new(1)), Gate::Proceed);
        assert_eq!(
            governor.before_send(ChatId::new(2)),
            Gate::WaitFor(Duration::from_millis(50))
        );
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(governor.before_send(ChatId::new(2)), Gate::Proceed);
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let governor = governor();
        assert_eq!(governor.backoff_ceiling(0), Duration::from_millis(100));
        assert_eq!(governor.backoff_ceiling(1), Duration::from_millis(200));
        assert_eq!(governor.backoff_ceiling(3), Duration::from_millis(800));
        assert_eq!(governor.backoff_ceiling(30), Duration::from_secs(5));
        for attempt in 0..8 {
            assert!(governor.backoff_delay(attempt) <= governor.backoff_ceiling(attempt));
        }
    }
}
