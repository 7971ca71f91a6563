use std::collections::HashMap;

use time::OffsetDateTime;

use quotio_common::RotationStrategy;

use crate::credential::AuthStatus;
use crate::state::RuntimeCredential;

/// Round-robin cursors wrap here instead of growing unboundedly.
pub const CURSOR_WRAP: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Disabled,
    Cooldown,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Blocked {
        reason: BlockReason,
        next_retry: Option<OffsetDateTime>,
    },
}

impl Eligibility {
    fn blocked(reason: BlockReason, next_retry: Option<OffsetDateTime>) -> Self {
        Eligibility::Blocked { reason, next_retry }
    }
}

/// Shared filter applied before any strategy runs.
pub fn eligibility(cred: &RuntimeCredential, model: &str, now: OffsetDateTime) -> Eligibility {
    if cred.is_disabled() {
        return Eligibility::blocked(BlockReason::Disabled, None);
    }
    // A failed refresh leaves the stored record in `error` until it is
    // re-authorised externally.
    if cred.auth.status == AuthStatus::Error {
        return Eligibility::blocked(BlockReason::Other, None);
    }

    if !model.is_empty()
        && let Some(state) = cred.model_states.get(model)
    {
        if state.status == crate::state::RuntimeStatus::Disabled {
            return Eligibility::blocked(BlockReason::Disabled, None);
        }
        if state.unavailable {
            return match state.next_retry_after {
                // No deadline recorded: ready to retry right away.
                None => Eligibility::Eligible,
                Some(at) if at <= now => Eligibility::Eligible,
                Some(at) => {
                    let next_retry = [Some(at), state.quota.next_recover_at, Some(now)]
                        .into_iter()
                        .flatten()
                        .max();
                    let reason = if state.quota.exceeded {
                        BlockReason::Cooldown
                    } else {
                        BlockReason::Other
                    };
                    Eligibility::blocked(reason, next_retry)
                }
            };
        }
        return Eligibility::Eligible;
    }

    if cred.unavailable
        && let Some(at) = cred.next_retry_after
        && at > now
    {
        let next_retry = [Some(at), cred.quota.next_recover_at, Some(now)]
            .into_iter()
            .flatten()
            .max();
        let reason = if cred.quota.exceeded {
            BlockReason::Cooldown
        } else {
            BlockReason::Other
        };
        return Eligibility::blocked(reason, next_retry);
    }

    Eligibility::Eligible
}

/// Cursor state for the round-robin strategy, keyed by `provider:model`.
#[derive(Debug, Default)]
pub struct SelectorState {
    cursors: HashMap<String, u32>,
}

impl SelectorState {
    fn advance(&mut self, key: String) -> u32 {
        let cursor = self.cursors.entry(key).or_insert(0);
        let current = *cursor;
        *cursor = if current + 1 >= CURSOR_WRAP {
            0
        } else {
            current + 1
        };
        current
    }
}

/// Pick one credential id out of an eligible candidate list.
///
/// Both strategies keep only the highest priority bucket and order it by id
/// ascending; round-robin walks the bucket with a per-`provider:model`
/// cursor, fill-first always takes the head.
pub fn select_candidate(
    state: &mut SelectorState,
    strategy: RotationStrategy,
    provider: &str,
    model: &str,
    candidates: &[&RuntimeCredential],
) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    let top_priority = candidates
        .iter()
        .map(|cred| cred.auth.priority())
        .max()
        .expect("non-empty candidate list");
    let mut bucket: Vec<&RuntimeCredential> = candidates
        .iter()
        .copied()
        .filter(|cred| cred.auth.priority() == top_priority)
        .collect();
    bucket.sort_by(|a, b| a.auth.id.cmp(&b.auth.id));

    let index = match strategy {
        RotationStrategy::FillFirst => 0,
        RotationStrategy::RoundRobin => {
            let cursor = state.advance(format!("{provider}:{model}"));
            (cursor as usize) % bucket.len()
        }
    };
    Some(bucket[index].auth.id.clone())
}
