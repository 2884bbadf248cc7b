pub mod delivery;
pub mod envelope;
pub mod login;

pub use envelope::{Envelope, Topic};
