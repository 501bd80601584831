//! In-memory collaborators for testing the protocol engine end to end. They are part of the
//!  crate's regular code so that applications can use them for their own tests.

pub mod application;
pub mod loopback;
