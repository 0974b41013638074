//! The concrete plugins, one per configuration entry kind.

pub mod fstab;
pub mod local_loop;
pub mod lvm;
pub mod mkfs;
pub mod mount;
pub mod partitioning;

#[cfg(test)]
pub(crate) mod test_utils;
