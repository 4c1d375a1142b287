//! faceattendd: Capture loop, recognition client and API gateway.
//!
//! Frames from the active camera are posted to the attendance service on a
//! timer; recognized faces feed the presence tracker and produce
//! Welcome/Goodbye notifications. The gateway relays `/api/*` calls to the
//! same service.

pub mod client;
pub mod config;
pub mod context;
pub mod proxy;
pub mod scheduler;
pub mod store;

pub use client::{AttendanceClient, Recognizer};
pub use config::{Config, ConfigError};
pub use context::ApiContext;
pub use proxy::{GatewayError, GatewayState};
pub use scheduler::{
    CaptureScheduler, SchedulerConfig, SchedulerError, SchedulerEvent, SchedulerHandle,
    SchedulerState, SchedulerStatus,
};
pub use store::{CameraPreset, LocalStore, StoreError};
