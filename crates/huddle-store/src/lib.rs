//! Session state and event fan-out over Redis, served from an in-process
//! fallback whenever the server is unreachable.

pub mod backend;
pub mod backplane;
pub mod broadcast;
pub mod connection;
pub mod fallback;
pub mod health;
pub mod mock;
pub mod participants;
pub mod redis;
pub mod retry;
pub mod shutdown;
pub mod state;

pub use backend::{
    CommandConnection, Connector, MessageStream, PublishConnection, SubscribeConnection,
};
pub use backplane::Backplane;
pub use broadcast::{EventBroadcaster, SubscriptionHandle};
pub use connection::{ConnectionManager, Route};
pub use fallback::FallbackStore;
pub use mock::MockConnector;
pub use participants::ParticipantRegistry;
pub use crate::redis::RedisConnector;
pub use retry::RetryPolicy;
pub use shutdown::shutdown_signal;
pub use state::StateStore;
