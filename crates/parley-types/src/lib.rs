//! Shared vocabulary for the Parley chat client: entities, wire payloads,
//! endpoint paths, real-time events and the request error taxonomy.

pub mod api;
pub mod error;
pub mod events;
pub mod models;

pub use error::{ApiError, StatusClass};
pub use models::{MessageId, UserId};
