pub mod balance;
pub mod batcher;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod papers;
pub mod probe;
pub mod progress_channel;
pub mod reconnect;
pub mod requests;
pub mod session;
pub mod simulator;
pub mod transport;
pub mod word_count;

pub use crate::collaborators::{ChapterRef, Collaborators, HttpBackend};
pub use crate::config::{GeneratorConfig, ServerConfig, StreamConfig};
pub use crate::error::{ErrorCode, GenerationError, Result};
pub use crate::events::{GenerationType, ServerEvent, StreamRequest};
pub use crate::orchestrator::{GenerationOptions, GenerationOrchestrator, GenerationState, Selection};
pub use crate::probe::{ConnectionProbe, NetworkStatus};
pub use crate::progress_channel::{ProgressChannelListener, ProjectProgress};
pub use crate::requests::{CancellationToken, RequestManager};
pub use crate::session::{SessionOutcome, SessionStatus, StreamSession};
pub use crate::transport::{EventTransport, SseTransport};
