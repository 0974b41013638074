pub mod container;
pub mod dependencies;
pub mod files;
pub mod kpartx;
pub mod losetup;
pub mod lvm;
pub mod mbr;
pub mod mkfs;
pub mod mount;
pub mod mountpoint;
pub mod partprobe;
pub mod path;
pub mod tabfile;
pub mod udevadm;

#[cfg(any(test, feature = "test-utilities"))]
pub mod testutils;
