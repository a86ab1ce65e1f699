//! REST endpoint bindings. Each call goes through the session gateway and
//! normalizes its response into a fixed entity type before returning.

pub mod auth;
pub mod client;
pub mod friends;
pub mod messages;
pub mod outcome;
pub mod profile;

pub use client::ApiClient;
pub use messages::MediaUpload;
pub use outcome::Outcome;
