//! Presence state machine over batches of recognition observations.
//!
//! Each subject moves `None -> Present -> Departed`, and may re-enter from
//! `Departed`. Transitions produce [`AttendanceEvent`]s, deduplicated per
//! `(subject, kind)` inside a suppression window so recognition jitter does
//! not spam notifications.

use crate::types::{
    Action, AttendanceEvent, AttendanceStatus, EventKind, RecognitionObservation, Subject,
    SubjectId, TrackedPresence,
};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

pub const DEFAULT_SUPPRESSION_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(120);

/// What a `Departed` subject needs in order to become `Present` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReentryPolicy {
    /// Any sighting re-enters the subject.
    #[default]
    OnSighting,
    /// Only an explicit `check-in` action re-enters the subject.
    RequireCheckIn,
}

impl ReentryPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sighting" | "on-sighting" | "on_sighting" => Some(Self::OnSighting),
            "check-in" | "checkin" | "check_in" | "require-check-in" => Some(Self::RequireCheckIn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Minimum gap between two events with the same subject and kind.
    pub suppression_window: Duration,
    /// Records unseen for longer than this are dropped.
    pub idle_eviction: Duration,
    pub reentry: ReentryPolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            suppression_window: DEFAULT_SUPPRESSION_WINDOW,
            idle_eviction: DEFAULT_IDLE_EVICTION,
            reentry: ReentryPolicy::default(),
        }
    }
}

/// Per-subject presence tracker. Not thread-safe; owned by the capture loop.
#[derive(Debug)]
pub struct PresenceTracker {
    config: TrackerConfig,
    entries: HashMap<SubjectId, TrackedPresence>,
    last_emitted: HashMap<(SubjectId, EventKind), Instant>,
}

impl PresenceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            last_emitted: HashMap::new(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Fold one batch (all faces of one frame) into the tracker.
    ///
    /// Returns the events that survived deduplication, in transition order.
    pub fn observe(
        &mut self,
        batch: &[RecognitionObservation],
        now: Instant,
    ) -> Vec<AttendanceEvent> {
        let mut transitions: Vec<(EventKind, Subject)> = Vec::new();
        let mut seen: HashSet<SubjectId> = HashSet::new();

        for obs in batch {
            let Some(subject) = &obs.subject else {
                continue;
            };
            seen.insert(subject.id.clone());
            if let Some(kind) = self.apply_observation(subject, obs, now) {
                transitions.push((kind, subject.clone()));
            }
        }

        for entry in self.entries.values_mut() {
            if seen.contains(&entry.subject.id) {
                continue;
            }
            entry.present = false;
            if entry.status == AttendanceStatus::Present {
                entry.status = AttendanceStatus::Departed;
                transitions.push((EventKind::Leave, entry.subject.clone()));
            }
        }

        self.evict_idle(now);

        let events = transitions
            .into_iter()
            .filter_map(|(kind, subject)| self.emit(kind, subject, now))
            .collect::<Vec<_>>();

        if !events.is_empty() {
            tracing::debug!(
                events = events.len(),
                tracked = self.entries.len(),
                "presence transitions"
            );
        }
        events
    }

    /// Update (or create) a subject's record and return the transition, if any.
    fn apply_observation(
        &mut self,
        subject: &Subject,
        obs: &RecognitionObservation,
        now: Instant,
    ) -> Option<EventKind> {
        let reentry = self.config.reentry;

        let Some(entry) = self.entries.get_mut(&subject.id) else {
            let (status, kind) = match obs.action {
                Some(Action::CheckOut) => (AttendanceStatus::Departed, EventKind::Leave),
                _ => (AttendanceStatus::Present, EventKind::Enter),
            };
            self.entries.insert(
                subject.id.clone(),
                TrackedPresence {
                    subject: subject.clone(),
                    last_seen: now,
                    present: true,
                    bbox: obs.bbox,
                    confidence: obs.confidence,
                    status,
                },
            );
            return Some(kind);
        };

        entry.subject.name.clone_from(&subject.name);
        entry.last_seen = now;
        entry.present = true;
        if obs.bbox.is_some() {
            entry.bbox = obs.bbox;
        }
        entry.confidence = obs.confidence;

        let next = match (entry.status, obs.action) {
            (AttendanceStatus::Present, Some(Action::CheckOut)) => {
                Some((AttendanceStatus::Departed, EventKind::Leave))
            }
            (AttendanceStatus::Present, _) => None,
            (_, Some(Action::CheckIn)) => Some((AttendanceStatus::Present, EventKind::Enter)),
            (AttendanceStatus::None, None) => Some((AttendanceStatus::Present, EventKind::Enter)),
            (AttendanceStatus::Departed, None) if reentry == ReentryPolicy::OnSighting => {
                Some((AttendanceStatus::Present, EventKind::Enter))
            }
            _ => None,
        };

        next.map(|(status, kind)| {
            entry.status = status;
            kind
        })
    }

    fn emit(&mut self, kind: EventKind, subject: Subject, now: Instant) -> Option<AttendanceEvent> {
        let key = (subject.id.clone(), kind);
        if let Some(&last) = self.last_emitted.get(&key) {
            if now.saturating_duration_since(last) < self.config.suppression_window {
                tracing::trace!(subject = %subject.id, kind = kind.as_str(), "event suppressed");
                return None;
            }
        }
        self.last_emitted.insert(key, now);
        Some(AttendanceEvent::new(kind, subject))
    }

    fn evict_idle(&mut self, now: Instant) {
        let idle = self.config.idle_eviction;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_seen) <= idle);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle presence records");
        }

        let window = self.config.suppression_window;
        self.last_emitted
            .retain(|_, at| now.saturating_duration_since(*at) < window);
    }

    pub fn get(&self, id: &SubjectId) -> Option<&TrackedPresence> {
        self.entries.get(id)
    }

    /// `AttendanceStatus::None` for subjects that are not tracked.
    pub fn status(&self, id: &SubjectId) -> AttendanceStatus {
        self.entries
            .get(id)
            .map(|e| e.status)
            .unwrap_or(AttendanceStatus::None)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn present_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.status == AttendanceStatus::Present)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedPresence> {
        self.entries.values()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_emitted.clear();
    }
}
