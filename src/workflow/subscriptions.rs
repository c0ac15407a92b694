//! Container-event subscriptions: an explicit pub/sub value type.
//!
//! The runtime owns the subscription set. Observations of the active page
//! are fed in; appear/exist/change/disappear events come out, already
//! cooled down and collapsed. The observer bus is not involved: these
//! events are lossless up to the bounded dispatch queue.

use crate::workflow::schema::ContainerEventKind;
use std::collections::HashMap;
use std::time::Instant;

/// One block's interest in one container event.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscribing block.
    pub id: String,
    /// Container id observed.
    pub topic: String,
    pub event: ContainerEventKind,
    pub cooldown_ms: u64,
    pub last_fired_at: Option<Instant>,
    pub once_per_appear: bool,
    fired_this_appearance: bool,
}

impl Subscription {
    pub fn new(
        id: String,
        topic: String,
        event: ContainerEventKind,
        cooldown_ms: u64,
        once_per_appear: bool,
    ) -> Self {
        Self {
            id,
            topic,
            event,
            cooldown_ms,
            last_fired_at: None,
            once_per_appear,
            fired_this_appearance: false,
        }
    }
}

/// Last observed state of one container.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerState {
    pub present: bool,
    pub count: usize,
    pub signature: u64,
}

/// A trigger ready for dispatch.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub block_id: String,
    pub container: String,
    pub event: ContainerEventKind,
    /// Signature of the observation that fired this event, for per-block
    /// dedup.
    pub signature: u64,
    /// Hard-stop triggers preempt the dispatch queue.
    pub hard_stop: bool,
}

pub struct SubscriptionSet {
    subs: Vec<Subscription>,
    states: HashMap<String, ContainerState>,
}

impl SubscriptionSet {
    pub fn new(subs: Vec<Subscription>) -> Self {
        Self {
            subs,
            states: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Distinct container ids the runtime must observe.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subs.iter().map(|s| s.topic.clone()).collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Feed one observation of a container; returns the trigger events it
    /// produces. `hard_stop` marks guard-anchored containers.
    pub fn observe(
        &mut self,
        topic: &str,
        observed: ContainerState,
        now: Instant,
        hard_stop: bool,
    ) -> Vec<TriggerEvent> {
        let previous = self.states.insert(topic.to_string(), observed).unwrap_or_default();

        let appeared = observed.present && !previous.present;
        let disappeared = !observed.present && previous.present;
        let changed =
            observed.present && previous.present && observed.signature != previous.signature;

        let mut fired = Vec::new();
        for sub in self.subs.iter_mut().filter(|s| s.topic == topic) {
            let hit = match sub.event {
                ContainerEventKind::Appear => appeared,
                ContainerEventKind::Disappear => disappeared,
                ContainerEventKind::Change => changed,
                ContainerEventKind::Exist => observed.present,
            };

            if disappeared {
                sub.fired_this_appearance = false;
            }
            if !hit {
                continue;
            }
            if sub.once_per_appear && sub.fired_this_appearance {
                continue;
            }
            if let Some(last) = sub.last_fired_at {
                let elapsed = now.duration_since(last).as_millis() as u64;
                if elapsed < sub.cooldown_ms {
                    continue;
                }
            }

            sub.last_fired_at = Some(now);
            sub.fired_this_appearance = true;
            fired.push(TriggerEvent {
                block_id: sub.id.clone(),
                container: topic.to_string(),
                event: sub.event,
                signature: observed.signature,
                hard_stop,
            });
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(signature: u64) -> ContainerState {
        ContainerState {
            present: true,
            count: 1,
            signature,
        }
    }

    fn absent() -> ContainerState {
        ContainerState::default()
    }

    #[test]
    fn test_appear_fires_on_transition_only() {
        let mut set = SubscriptionSet::new(vec![Subscription::new(
            "b1".into(),
            "xiaohongshu_detail.comments".into(),
            ContainerEventKind::Appear,
            0,
            false,
        )]);
        let t = Instant::now();

        assert!(set
            .observe("xiaohongshu_detail.comments", absent(), t, false)
            .is_empty());
        let fired = set.observe("xiaohongshu_detail.comments", present(7), t, false);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].block_id, "b1");
        // Still present: no second appear.
        assert!(set
            .observe("xiaohongshu_detail.comments", present(7), t, false)
            .is_empty());
    }

    #[test]
    fn test_change_fires_on_signature_drift() {
        let mut set = SubscriptionSet::new(vec![Subscription::new(
            "b1".into(),
            "c".into(),
            ContainerEventKind::Change,
            0,
            false,
        )]);
        let t = Instant::now();

        set.observe("c", present(1), t, false);
        assert!(set.observe("c", present(1), t, false).is_empty());
        let fired = set.observe("c", present(2), t, false);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].signature, 2);
    }

    #[test]
    fn test_once_per_appear_collapses_bursts() {
        let mut set = SubscriptionSet::new(vec![Subscription::new(
            "b1".into(),
            "c".into(),
            ContainerEventKind::Exist,
            0,
            true,
        )]);
        let t = Instant::now();

        assert_eq!(set.observe("c", present(1), t, false).len(), 1);
        assert!(set.observe("c", present(1), t, false).is_empty());
        assert!(set.observe("c", present(2), t, false).is_empty());

        // Disappear resets the latch.
        set.observe("c", absent(), t, false);
        assert_eq!(set.observe("c", present(3), t, false).len(), 1);
    }

    #[test]
    fn test_cooldown_suppresses_rapid_fires() {
        let mut set = SubscriptionSet::new(vec![Subscription::new(
            "b1".into(),
            "c".into(),
            ContainerEventKind::Exist,
            10_000,
            false,
        )]);
        let t = Instant::now();

        assert_eq!(set.observe("c", present(1), t, false).len(), 1);
        assert!(set.observe("c", present(1), t, false).is_empty());

        let later = t + std::time::Duration::from_millis(11_000);
        assert_eq!(set.observe("c", present(1), later, false).len(), 1);
    }

    #[test]
    fn test_disappear() {
        let mut set = SubscriptionSet::new(vec![Subscription::new(
            "b1".into(),
            "c".into(),
            ContainerEventKind::Disappear,
            0,
            false,
        )]);
        let t = Instant::now();

        set.observe("c", present(1), t, false);
        let fired = set.observe("c", absent(), t, false);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event, ContainerEventKind::Disappear);
    }

    #[test]
    fn test_topics_deduped() {
        let set = SubscriptionSet::new(vec![
            Subscription::new("b1".into(), "c".into(), ContainerEventKind::Appear, 0, false),
            Subscription::new("b2".into(), "c".into(), ContainerEventKind::Exist, 0, false),
            Subscription::new("b3".into(), "d".into(), ContainerEventKind::Appear, 0, false),
        ]);
        assert_eq!(set.topics(), vec!["c".to_string(), "d".to_string()]);
    }
}
