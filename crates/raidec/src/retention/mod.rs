//! Retention layer primitives: disks, range locking, and the disk array.

pub mod array;
pub mod disk;
pub mod locker;
