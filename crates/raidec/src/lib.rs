//! Erasure-coded RAID volume engine over file-emulated disks.
#![allow(clippy::cargo_common_metadata)]

pub mod layout;
pub mod metrics;
pub mod retention;
