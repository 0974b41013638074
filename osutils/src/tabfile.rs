use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

/// A representation of a fstab file.
#[derive(Debug, Default)]
pub struct TabFile {
    pub entries: Vec<TabFileEntry>,
}

/// A representation of a single entry in a tab file.
#[derive(Debug, PartialEq, Eq)]
pub struct TabFileEntry {
    pub device: TabDevice,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: String,
    pub dump_freq: u32,
    pub fsck_passno: u32,
}

/// How an entry names its filesystem.
#[derive(Debug, PartialEq, Eq)]
pub enum TabDevice {
    Label(String),
    Uuid(String),
}

impl TabFile {
    /// Write this tab file to disk at location `tab_file_path`.
    pub fn write(&self, tab_file_path: impl AsRef<Path>) -> Result<(), Error> {
        std::fs::write(tab_file_path.as_ref(), self.render().as_bytes())
            .with_context(|| format!("Failed to write new {}", tab_file_path.as_ref().display()))
    }

    /// Render this tab file as a string.
    pub fn render(&self) -> String {
        self.entries.iter().map(|entry| entry.render()).collect()
    }
}

impl TabFileEntry {
    /// Render this entry as a string suitable for writing to a tab file.
    pub fn render(&self) -> String {
        format!(
            "{} {} {} {} {} {}\n",
            self.device.render(),
            self.mount_point.display(),
            self.fs_type,
            self.options,
            self.dump_freq,
            self.fsck_passno,
        )
    }
}

impl TabDevice {
    /// Prefers the label; filesystems without one are named by UUID.
    pub fn new(label: &str, uuid: &str) -> Self {
        if label.is_empty() {
            TabDevice::Uuid(uuid.into())
        } else {
            TabDevice::Label(label.into())
        }
    }

    /// Render this device as a string.
    pub fn render(&self) -> String {
        match self {
            TabDevice::Label(label) => format!("LABEL={label}"),
            TabDevice::Uuid(uuid) => format!("UUID={uuid}"),
        }
    }
}
