use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Opaque subject identifier issued by the directory service (student ID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A person the recognition service can identify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub name: String,
}

impl Subject {
    pub fn new(id: impl Into<SubjectId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Attendance action inferred by the recognition service for one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    CheckIn,
    CheckOut,
}

impl Action {
    /// Lenient parse: accepts `check-in`, `check_in`, `checkin` and the
    /// check-out equivalents in any case. Anything else is no action.
    pub fn parse(raw: &str) -> Option<Self> {
        let folded: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        match folded.as_str() {
            "checkin" => Some(Self::CheckIn),
            "checkout" => Some(Self::CheckOut),
            _ => None,
        }
    }
}

/// Face bounding box as reported by the service: `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundingBox(pub [f32; 4]);

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.0[2] - self.0[0]).abs()
    }

    pub fn height(&self) -> f32 {
        (self.0[3] - self.0[1]).abs()
    }
}

/// One detected face in one submitted frame.
#[derive(Debug, Clone)]
pub struct RecognitionObservation {
    /// `None` when the face did not match any enrolled subject.
    pub subject: Option<Subject>,
    /// Match score in [0, 1].
    pub confidence: f32,
    pub bbox: Option<BoundingBox>,
    pub action: Option<Action>,
    pub observed_at: Instant,
}

impl RecognitionObservation {
    pub fn recognized(subject: Subject, confidence: f32, observed_at: Instant) -> Self {
        Self {
            subject: Some(subject),
            confidence: confidence.clamp(0.0, 1.0),
            bbox: None,
            action: None,
            observed_at,
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn is_recognized(&self) -> bool {
        self.subject.is_some()
    }
}

/// Per-subject attendance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    #[default]
    None,
    Present,
    Departed,
}

/// Mutable presence record, owned by the tracker.
#[derive(Debug, Clone)]
pub struct TrackedPresence {
    pub subject: Subject,
    pub last_seen: Instant,
    /// Seen in the most recent batch.
    pub present: bool,
    pub bbox: Option<BoundingBox>,
    pub confidence: f32,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Enter,
    Leave,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Leave => "leave",
        }
    }
}

/// A notification-worthy presence transition.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub subject: Subject,
    pub text: String,
    pub occurred_at: DateTime<Utc>,
    /// `<subject-id>:<kind>`, stable across repeats of the same transition.
    pub key: String,
}

impl AttendanceEvent {
    pub fn new(kind: EventKind, subject: Subject) -> Self {
        let text = match kind {
            EventKind::Enter => format!("Welcome, {}", subject.name),
            EventKind::Leave => format!("Goodbye, {}", subject.name),
        };
        let key = format!("{}:{}", subject.id, kind.as_str());
        Self {
            id: Uuid::new_v4(),
            kind,
            subject,
            text,
            occurred_at: Utc::now(),
            key,
        }
    }
}
