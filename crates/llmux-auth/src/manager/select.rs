use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

use crate::entity::{Auth, AuthStatus};
use crate::model::suffix::parse_suffix;

/// Cursor table cap for the round-robin selector; oldest entries are evicted
/// once it fills.
pub const DEFAULT_MAX_CURSOR_KEYS: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct PickOptions {
    /// Auth ids the caller already tried this request.
    pub exclude_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickError {
    /// Every candidate was filtered out before bucket selection.
    NoCandidates,
    /// Candidates exist but all are blocked on the requested model.
    Cooldown { retry_after: Option<Duration> },
}

pub trait Selector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Choose one auth id for `(provider, model)` out of `candidates`.
    fn pick(
        &self,
        provider: &str,
        model: &str,
        opts: &PickOptions,
        candidates: &[&Auth],
        now: OffsetDateTime,
    ) -> Result<String, PickError>;
}

fn eligible(auth: &Auth, model: &str, opts: &PickOptions, now: OffsetDateTime) -> bool {
    if auth.disabled {
        return false;
    }
    if opts.exclude_ids.iter().any(|id| *id == auth.id) {
        return false;
    }
    if auth.status == AuthStatus::Error
        && auth.next_retry_after.is_some_and(|at| at > now)
    {
        return false;
    }
    !auth.is_model_excluded(model)
}

fn blocked(auth: &Auth, model: &str, now: OffsetDateTime) -> bool {
    auth.model_state(model).is_some_and(|ms| ms.blocked(now))
}

/// Split eligible candidates into priority buckets (descending) and return
/// the highest bucket with at least one unblocked member, or `Err` with the
/// nearest recovery time when everything is blocked.
fn choose_bucket<'a>(
    model: &str,
    candidates: &[&'a Auth],
    opts: &PickOptions,
    now: OffsetDateTime,
) -> Result<Vec<&'a Auth>, PickError> {
    let eligible: Vec<&Auth> = candidates
        .iter()
        .copied()
        .filter(|a| self::eligible(a, model, opts, now))
        .collect();
    if eligible.is_empty() {
        return Err(PickError::NoCandidates);
    }

    let mut buckets: HashMap<i32, Vec<&Auth>> = HashMap::new();
    for auth in &eligible {
        buckets.entry(auth.priority()).or_default().push(auth);
    }
    let mut priorities: Vec<i32> = buckets.keys().copied().collect();
    priorities.sort_unstable_by(|a, b| b.cmp(a));

    for priority in priorities {
        let mut bucket = buckets.remove(&priority).unwrap_or_default();
        bucket.sort_by(|a, b| a.id.cmp(&b.id));
        if bucket.iter().any(|a| !blocked(a, model, now)) {
            return Ok(bucket);
        }
    }

    // Everything is blocked; report how long the nearest candidate needs.
    let retry_after = eligible
        .iter()
        .filter_map(|a| a.model_state(model))
        .filter_map(|ms| {
            ms.next_retry_after
                .into_iter()
                .chain(ms.quota.next_recover_at)
                .filter(|at| *at > now)
                .min()
        })
        .min()
        .map(|at| {
            let secs = (at - now).whole_seconds().max(1) as u64;
            Duration::from_secs(secs)
        });
    Err(PickError::Cooldown { retry_after })
}

/// Deterministic selector: lowest id wins.
#[derive(Debug, Default)]
pub struct FillFirstSelector;

impl Selector for FillFirstSelector {
    fn name(&self) -> &'static str {
        "fill-first"
    }

    fn pick(
        &self,
        _provider: &str,
        model: &str,
        opts: &PickOptions,
        candidates: &[&Auth],
        now: OffsetDateTime,
    ) -> Result<String, PickError> {
        let bucket = choose_bucket(model, candidates, opts, now)?;
        bucket
            .iter()
            .find(|a| !blocked(a, model, now))
            .map(|a| a.id.clone())
            .ok_or(PickError::NoCandidates)
    }
}

struct Cursor {
    next: usize,
    seq: u64,
}

/// Rotates through the chosen bucket with one cursor per
/// `provider:base_model`. Thinking suffixes share their base model's cursor.
pub struct RoundRobinSelector {
    cursors: Mutex<HashMap<String, Cursor>>,
    max_keys: usize,
    seq: std::sync::atomic::AtomicU64,
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CURSOR_KEYS)
    }
}

impl RoundRobinSelector {
    pub fn new(max_keys: usize) -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
            max_keys: max_keys.max(1),
            seq: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl Selector for RoundRobinSelector {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn pick(
        &self,
        provider: &str,
        model: &str,
        opts: &PickOptions,
        candidates: &[&Auth],
        now: OffsetDateTime,
    ) -> Result<String, PickError> {
        let bucket = choose_bucket(model, candidates, opts, now)?;
        let key = format!(
            "{provider}:{}",
            parse_suffix(model).base.to_ascii_lowercase()
        );

        let mut cursors = self.cursors.lock().expect("cursor lock poisoned");
        let start = cursors.get(&key).map_or(0, |c| c.next) % bucket.len();

        let mut chosen = None;
        for offset in 0..bucket.len() {
            let idx = (start + offset) % bucket.len();
            if !blocked(bucket[idx], model, now) {
                chosen = Some(idx);
                break;
            }
        }
        let Some(idx) = chosen else {
            return Err(PickError::NoCandidates);
        };

        let seq = self
            .seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        cursors.insert(
            key,
            Cursor {
                next: (idx + 1) % bucket.len(),
                seq,
            },
        );
        if cursors.len() > self.max_keys {
            if let Some(oldest) = cursors
                .iter()
                .min_by_key(|(_, c)| c.seq)
                .map(|(k, _)| k.clone())
            {
                cursors.remove(&oldest);
            }
        }

        Ok(bucket[idx].id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ModelState, ATTR_PRIORITY};
    use time::macros::datetime;

    fn auth(id: &str, priority: i32) -> Auth {
        let mut a = Auth {
            id: id.to_string(),
            provider: "claude".to_string(),
            ..Auth::default()
        };
        if priority != 0 {
            a.attributes
                .insert(ATTR_PRIORITY.to_string(), priority.to_string());
        }
        a
    }

    fn block(a: &mut Auth, model: &str, until: OffsetDateTime) {
        *a.model_state_mut(model) = ModelState {
            unavailable: true,
            next_retry_after: Some(until),
            ..ModelState::default()
        };
    }

    #[test]
    fn fill_first_returns_smallest_unblocked_id() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let mut a = auth("a", 0);
        let b = auth("b", 0);
        let c = auth("c", 0);
        block(&mut a, "m", now + time::Duration::minutes(5));

        let selector = FillFirstSelector;
        let picked = selector
            .pick("claude", "m", &PickOptions::default(), &[&c, &a, &b], now)
            .unwrap();
        assert_eq!(picked, "b");
    }

    #[test]
    fn round_robin_cycles_in_sorted_order() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let a = auth("a", 0);
        let b = auth("b", 0);
        let c = auth("c", 0);
        let selector = RoundRobinSelector::default();

        let mut picks = Vec::new();
        for _ in 0..11 {
            picks.push(
                selector
                    .pick("claude", "m", &PickOptions::default(), &[&b, &c, &a], now)
                    .unwrap(),
            );
        }
        assert_eq!(
            picks,
            ["a", "b", "c", "a", "b", "c", "a", "b", "c", "a", "b"]
        );
    }

    #[test]
    fn suffix_shares_cursor_with_base_model() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let a = auth("a", 0);
        let b = auth("b", 0);
        let selector = RoundRobinSelector::default();
        let opts = PickOptions::default();

        let first = selector.pick("claude", "m", &opts, &[&a, &b], now).unwrap();
        let second = selector
            .pick("claude", "m(8192)", &opts, &[&a, &b], now)
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn priority_bucket_blocks_fall_through() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let mut hi1 = auth("hi1", 10);
        let mut hi2 = auth("hi2", 10);
        let lo = auth("lo", 0);
        block(&mut hi1, "m", now + time::Duration::minutes(5));
        block(&mut hi2, "m", now + time::Duration::minutes(5));

        let selector = FillFirstSelector;
        let picked = selector
            .pick("claude", "m", &PickOptions::default(), &[&hi1, &hi2, &lo], now)
            .unwrap();
        assert_eq!(picked, "lo");
    }

    #[test]
    fn blocked_only_on_requested_model() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let mut hi = auth("hi", 10);
        let lo = auth("lo", 0);
        block(&mut hi, "m", now + time::Duration::minutes(5));

        let selector = FillFirstSelector;
        // Another model still sees the high-priority bucket.
        let picked = selector
            .pick("claude", "other", &PickOptions::default(), &[&hi, &lo], now)
            .unwrap();
        assert_eq!(picked, "hi");
    }

    #[test]
    fn all_blocked_yields_cooldown_with_nearest_retry() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let mut a = auth("a", 0);
        let mut b = auth("b", 0);
        block(&mut a, "m", now + time::Duration::minutes(5));
        block(&mut b, "m", now + time::Duration::minutes(2));

        let selector = FillFirstSelector;
        let err = selector
            .pick("claude", "m", &PickOptions::default(), &[&a, &b], now)
            .unwrap_err();
        assert_eq!(
            err,
            PickError::Cooldown {
                retry_after: Some(Duration::from_secs(120)),
            }
        );
    }

    #[test]
    fn disabled_and_excluded_are_filtered() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let mut a = auth("a", 0);
        a.disabled = true;
        let mut b = auth("b", 0);
        b.attributes.insert(
            crate::entity::ATTR_EXCLUDED_MODELS.to_string(),
            "m".to_string(),
        );

        let selector = FillFirstSelector;
        let err = selector
            .pick("claude", "m(high)", &PickOptions::default(), &[&a, &b], now)
            .unwrap_err();
        assert_eq!(err, PickError::NoCandidates);
    }

    #[test]
    fn unavailable_without_timestamp_is_still_selectable() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let mut a = auth("a", 0);
        a.model_state_mut("m").unavailable = true;

        let selector = FillFirstSelector;
        let picked = selector
            .pick("claude", "m", &PickOptions::default(), &[&a], now)
            .unwrap();
        assert_eq!(picked, "a");
    }

    #[test]
    fn cursor_table_evicts_oldest_key() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let a = auth("a", 0);
        let b = auth("b", 0);
        let selector = RoundRobinSelector::new(2);
        let opts = PickOptions::default();

        assert_eq!(selector.pick("p", "m1", &opts, &[&a, &b], now).unwrap(), "a");
        assert_eq!(selector.pick("p", "m2", &opts, &[&a, &b], now).unwrap(), "a");
        // Touch m1 so m2 becomes the oldest, then overflow with m3.
        assert_eq!(selector.pick("p", "m1", &opts, &[&a, &b], now).unwrap(), "b");
        assert_eq!(selector.pick("p", "m3", &opts, &[&a, &b], now).unwrap(), "a");
        // m2's cursor was evicted and starts over instead of continuing.
        assert_eq!(selector.pick("p", "m2", &opts, &[&a, &b], now).unwrap(), "a");
    }
}
