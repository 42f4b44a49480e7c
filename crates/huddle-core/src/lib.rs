pub mod errors;
pub mod events;
pub mod keys;
pub mod participants;
pub mod settings;
pub mod status;

pub use errors::{BackendError, SettingsError};
pub use events::EventEnvelope;
pub use participants::ParticipantRecord;
pub use settings::{load_settings, HuddleSettings};
pub use status::{BackendMode, ConnectivityState, HealthReport, HealthStatus};
