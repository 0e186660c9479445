//! Lifecycle manager for a single Bedrock dedicated server: download the
//! package, unpack it, supervise the process and edit `server.properties`.

pub mod download;
pub mod error;
pub mod extract;
pub mod manager;
pub mod progress;
pub mod properties;
pub mod settings;
pub mod supervisor;
mod supervisor_support;

pub use download::{DownloadReport, Downloader};
pub use error::{PortalError, Result};
pub use extract::{ExtractReport, extract_latest_image, find_image};
pub use manager::ServerManager;
pub use portal_process::{ServerState, ServerStatus, SessionId};
pub use progress::ProgressSink;
pub use properties::ServerProperties;
pub use settings::Settings;
pub use supervisor::{OutputEvent, OutputSubscription, ServerSupervisor, SupervisorConfig};
