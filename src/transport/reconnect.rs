//! Bounded-retry reconnection policy.

use std::future::Future;
use std::time::Duration;

use super::state::{ConnectionState, StateTracker};
use super::{Result, TransportError};

#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, cap: Duration },
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(100),
                cap: Duration::from_secs(5),
            },
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Backoff delay after the given failed attempt (1-based). Exponential
    /// backoff doubles per attempt: base, 2*base, 4*base, ... up to the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, cap } => {
                let exp = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << exp).min(cap)
            }
        }
    }
}

/// Run reconnection attempts until one succeeds or the attempts run out.
///
/// Each attempt is expected to fully tear down and recreate the OS handle.
/// The first attempt runs immediately; backoff delays apply between
/// attempts. Emits Reconnecting before every attempt, Connected on
/// success, and a terminal Disconnected with `can_reconnect=false` on
/// exhaustion.
pub async fn run_with_policy<F, Fut>(
    policy: &ReconnectPolicy,
    tracker: &StateTracker,
    mut attempt_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            tokio::time::sleep(policy.delay_for(attempt - 1)).await;
        }
        tracker.transition(
            ConnectionState::Reconnecting,
            format!("Reconnect attempt {}/{}", attempt, policy.max_attempts),
            true,
        );
        match attempt_fn().await {
            Ok(()) => {
                tracker.transition(ConnectionState::Connected, "Reconnected", true);
                return Ok(());
            }
            Err(e) => log::warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }
    tracker.transition(
        ConnectionState::Disconnected,
        format!("Gave up after {} reconnect attempts", policy.max_attempts),
        false,
    );
    Err(TransportError::ReconnectExhausted {
        attempts: policy.max_attempts,
    })
}
