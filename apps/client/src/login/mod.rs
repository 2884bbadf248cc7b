// Scan-to-login handshake: HTTP client for the handshake service, retry
// policy for its flaky artifact endpoint, and the controller that polls it.

pub mod api;
pub mod backoff;
pub mod controller;

pub use api::{HandshakeApi, HttpHandshakeApi};
pub use backoff::BackoffPolicy;
pub use controller::{LoginFlowConfig, LoginFlowController, LoginFlowState, LoginSnapshot};
