//! Session gateway: every REST call goes through here so that it carries the
//! current bearer token, and so that an expired token is refreshed exactly
//! once no matter how many requests notice it at the same time.

pub mod credentials;
pub mod gateway;
pub mod tracker;
pub mod transport;

pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use gateway::{SessionEvent, SessionGateway};
pub use transport::{
    ApiRequest, ApiResponse, Method, RequestBody, ReqwestTransport, Transport, UploadPart,
    UploadProgress,
};
