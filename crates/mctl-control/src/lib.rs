pub mod client;
pub mod direct;
pub mod logging;
pub mod ops;
pub mod server;
pub mod supervisor;

pub use client::{ClientError, ControlClient};
pub use direct::{ControlHandle, DirectControl};
pub use ops::{mission_view, MissionOps, OpError};
pub use server::{ServerConfig, ServerError};
pub use supervisor::{CurrentExeSpawner, Spawner, StartOutcome, Supervisor, SupervisorError};

/// Version reported by the health probe and compared for skew detection.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
