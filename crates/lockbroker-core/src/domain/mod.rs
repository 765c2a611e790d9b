//! Domain layer
//!
//! Contains the locking domain: sessions, the lock table and the policies
//! that govern them.

pub mod locking;
