//! faceattend-core: Presence tracking for face-recognition attendance.
//!
//! Folds recognition results from a remote service into per-subject
//! check-in/check-out state and turns transitions into notifications.

pub mod notifications;
pub mod recognition;
pub mod tracker;
pub mod types;

pub use notifications::{Notification, NotificationQueue};
pub use recognition::{
    FailureKind, RecognitionResult, RecognizeResponse, SubmitFailure, SubmitOutcome,
};
pub use tracker::{PresenceTracker, ReentryPolicy, TrackerConfig};
pub use types::{
    Action, AttendanceEvent, AttendanceStatus, BoundingBox, EventKind, RecognitionObservation,
    Subject, SubjectId, TrackedPresence,
};
