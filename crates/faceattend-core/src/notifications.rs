//! Transient "Welcome, X" / "Goodbye, X" notifications.

use crate::types::AttendanceEvent;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_NOTIFICATION_TTL: Duration = Duration::from_secs(4);
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
pub struct Notification {
    pub event: AttendanceEvent,
    pub shown_at: Instant,
    pub expires_at: Instant,
}

impl Notification {
    pub fn text(&self) -> &str {
        &self.event.text
    }
}

/// Bounded FIFO of live notifications with a fixed time-to-live.
#[derive(Debug)]
pub struct NotificationQueue {
    ttl: Duration,
    capacity: usize,
    items: VecDeque<Notification>,
}

impl NotificationQueue {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            items: VecDeque::new(),
        }
    }

    /// Queue events; when full, the oldest notification is dropped.
    pub fn push<I>(&mut self, events: I, now: Instant)
    where
        I: IntoIterator<Item = AttendanceEvent>,
    {
        for event in events {
            if self.items.len() == self.capacity {
                self.items.pop_front();
            }
            self.items.push_back(Notification {
                event,
                shown_at: now,
                expires_at: now + self.ttl,
            });
        }
    }

    /// Live notifications, oldest first.
    pub fn active(&self, now: Instant) -> impl Iterator<Item = &Notification> {
        self.items.iter().filter(move |n| n.expires_at > now)
    }

    /// Remove and return everything whose time-to-live has elapsed.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<Notification> {
        let (live, expired): (VecDeque<_>, VecDeque<_>) =
            self.items.drain(..).partition(|n| n.expires_at > now);
        self.items = live;
        expired.into()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_TTL, DEFAULT_NOTIFICATION_CAPACITY)
    }
}
