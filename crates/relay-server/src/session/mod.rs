//! Session management: controller/target pairings.

pub mod manager;

pub use manager::{Session, SessionManager};
