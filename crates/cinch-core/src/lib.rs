pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod protocol;
pub mod repoconfig;

pub use config::{
    CinchConfig, DatabaseConfig, DispatchConfig, GatewayConfig, MaintenanceConfig, RelayConfig,
    SecurityConfig,
};
pub use error::{CinchError, Result};
pub use event::{
    CommitState, PullRequestEvent, PushEvent, RepoEventInfo, StatusUpdate, WebhookEvent,
};
pub use model::{
    ErrorPhase, ForgeIdentity, ForgeType, Job, JobId, JobOutcome, JobStatus, LogChunk, LogStream,
    RefType, Repo, RepoId, RepoKey, TokenId, TrustLevel, User, UserId, WorkerId, WorkerMode,
    WorkerRegistration, WorkerStatus, WorkerToken, MAX_CHUNK_BYTES,
};
pub use protocol::{
    JobEnvelope, JobRef, RelayFrame, RepoEnvelope, ServerMessage, ViewerMessage, WorkerMessage,
};
pub use repoconfig::{
    parse_duration_secs, ConfigFormat, ContainerSource, Healthcheck, RepoBuildConfig, ServiceSpec,
    CONFIG_FILENAMES,
};
