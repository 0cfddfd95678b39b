//! DOMES Core Library
//!
//! Coordination core for a group of reaction-training pods: master election
//! over a lossy broadcast medium, clock synchronization against the master,
//! and drill orchestration with per-pod command dispatch. Everything a pod
//! owns is driven from one coordination task (`runtime::PodRuntime`).

pub mod types;
pub mod error;
pub mod codec;
pub mod config;
pub mod outbox;
pub mod election;
pub mod clock_sync;
pub mod game;
pub mod command;
pub mod drill;
pub mod session;
pub mod transport;
pub mod runtime;

pub use types::*;
pub use error::{CodecError, ConfigError, SessionError, TransportError};
pub use codec::{Message, MessageType, Payload};
pub use config::PodConfig;
pub use election::ElectionService;
pub use clock_sync::{ClockEstimate, ClockSyncService};
pub use game::{EventSink, GameCapability, GameEvent};
pub use drill::{DrillProgram, DrillResult, Round, RoundResult, TargetSelector};
pub use session::{Notice, PodInput, SessionCoordinator, SessionStatus};
pub use transport::{Transport, UdpTransport};
pub use runtime::{PodHandle, PodRuntime};
