//! Bellhop: multiplexed browser session lifecycle and portal authentication.
//!
//! The crate keeps a registry of live page drivers, snapshots their cookie
//! and storage state to a durable store, sweeps idle sessions, recovers
//! in-use sessions after a crash, and drives the portal's login ritual
//! (challenge widget, credentials, out-of-band one-time code) end to end.

pub mod auth;
pub mod config;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod otp;
pub mod registry;
pub mod service;
pub mod snapshot;
pub mod solver;
pub mod store;

pub use auth::{AuthEngine, AuthOutcome, FailureReason, PageProbe, probe_login};
pub use config::{AuthConfig, Config, MailboxConfig, PortalConfig, Selectors, SolverConfig, SweepConfig};
pub use driver::{Cookie, DriverFactory, FrameInfo, PageDriver, StorageEntry, VisibilityMode};
pub use error::{BellhopError, Result};
pub use lifecycle::LifecycleController;
pub use otp::{HttpMailSource, OtpDelivery, OtpSource, OtpValue, SenderKind};
pub use registry::{SessionId, SessionLease, SessionRegistry};
pub use service::{SessionInfo, SessionService};
pub use snapshot::SessionSnapshot;
pub use solver::{ChallengePayload, ChallengeSolver, HttpSolver};
pub use store::{JsonFileStore, MemoryStore, StateStore};
