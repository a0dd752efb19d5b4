//! Data directory listing and bookkeeping.

pub mod inventory;
pub mod metadata;
pub mod walker;
