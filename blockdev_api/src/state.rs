use std::path::PathBuf;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    constants::state_keys,
    error::{BlockDeviceError, ReportError, StateError},
};

/// Facts produced by nodes during `create`, grouped by namespace (`blockdev`, `filesys`, ...).
///
/// Records are written once; later phases only read them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedState(Map<String, Value>);

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record` as `namespace.key`. Fails if the key is already set.
    pub fn insert(
        &mut self,
        namespace: &str,
        key: &str,
        record: &impl Serialize,
    ) -> Result<(), BlockDeviceError> {
        let value = serde_json::to_value(record).structured(StateError::Malformed {
            namespace: namespace.into(),
            key: key.into(),
        })?;

        let entries = self.namespace_mut(namespace)?;
        if entries.contains_key(key) {
            return Err(BlockDeviceError::new(StateError::KeyExists {
                namespace: namespace.into(),
                key: key.into(),
            }));
        }
        entries.insert(key.into(), value);
        Ok(())
    }

    /// Reads `namespace.key` as a typed record.
    pub fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<T, BlockDeviceError> {
        let value = self
            .0
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .structured(StateError::MissingKey {
                namespace: namespace.into(),
                key: key.into(),
            })?;
        serde_json::from_value(value.clone()).structured(StateError::Malformed {
            namespace: namespace.into(),
            key: key.into(),
        })
    }

    pub fn contains(&self, namespace: &str, key: &str) -> bool {
        self.0
            .get(namespace)
            .and_then(Value::as_object)
            .is_some_and(|ns| ns.contains_key(key))
    }

    /// Keys of a namespace, in insertion order.
    pub fn keys(&self, namespace: &str) -> Vec<&str> {
        self.0
            .get(namespace)
            .and_then(Value::as_object)
            .map(|ns| ns.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Appends a string to a list namespace such as `mount_order`.
    pub fn push(&mut self, namespace: &str, item: &str) -> Result<(), BlockDeviceError> {
        let list = self
            .0
            .entry(namespace)
            .or_insert_with(|| Value::Array(Vec::new()));
        list.as_array_mut()
            .structured(StateError::Malformed {
                namespace: namespace.into(),
                key: "[]".into(),
            })?
            .push(Value::String(item.into()));
        Ok(())
    }

    /// Reads a list namespace of strings; an absent namespace is empty.
    pub fn list(&self, namespace: &str) -> Result<Vec<String>, BlockDeviceError> {
        match self.0.get(namespace) {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value.clone()).structured(StateError::Malformed {
                namespace: namespace.into(),
                key: "[]".into(),
            }),
        }
    }

    /// Device path of the block device produced by node `name`.
    pub fn device_of(&self, name: &str) -> Result<PathBuf, BlockDeviceError> {
        self.get::<BlockDeviceRecord>(state_keys::BLOCKDEV, name)
            .map(|record| record.device)
    }

    fn namespace_mut(&mut self, namespace: &str) -> Result<&mut Map<String, Value>, BlockDeviceError> {
        self.0
            .entry(namespace)
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .structured(StateError::Malformed {
                namespace: namespace.into(),
                key: "{}".into(),
            })
    }
}

/// `blockdev.<name>`: any node that yields a block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceRecord {
    pub device: PathBuf,

    /// Backing file, for loop devices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
}

/// `blockdev.<lv>`: a logical volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolumeRecord {
    pub vgs: String,
    pub size: Option<String>,
    pub extents: Option<String>,
    pub opts: Vec<String>,
    pub device: PathBuf,
}

/// `pvs.<name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalVolumeRecord {
    pub opts: Vec<String>,
    pub device: PathBuf,
}

/// `vgs.<name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroupRecord {
    pub opts: Vec<String>,
    pub devices: Vec<PathBuf>,
}

/// `filesys.<name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemRecord {
    pub uuid: String,
    pub label: String,
    pub fstype: String,
    pub opts: Vec<String>,
    pub device: PathBuf,
}

/// `mount.<mount point>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub name: String,
    pub base: String,
    pub path: PathBuf,
}

/// `fstab.<mount name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FstabRecord {
    pub options: String,
    #[serde(rename = "dump-freq")]
    pub dump_freq: u32,
    #[serde(rename = "fsck-passno")]
    pub fsck_passno: u32,
}
