pub mod slot;
pub mod snapshot;
pub mod spool;
