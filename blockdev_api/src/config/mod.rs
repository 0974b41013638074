use std::{collections::BTreeSet, fmt, path::PathBuf};

use serde::{
    de::{self, MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::constants::{ROOT_FILESYSTEM_NAME, ROOT_MOUNT_POINT};

mod params;
pub mod plugins;
mod tree;

pub use params::Params;
pub use tree::config_tree_to_graph;

/// Closed set of plugin kinds a configuration entry can be keyed by.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    LocalLoop,
    Partitioning,
    Lvm,
    Mkfs,
    Mount,
    Fstab,
}

impl PluginKind {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// Errors found while compiling the configuration or building the graph from it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigError {
    #[error("Config is not a list of entries")]
    NotAList,
    #[error("Config entry not a mapping: {entry}")]
    NotAMapping { entry: String },
    #[error("Config entry top-level should be a single mapping: {entry}")]
    NotSingleKey { entry: String },
    #[error("Config entry is not a plugin value: {key}")]
    UnknownPlugin { key: String },
    #[error("Entry of kind '{kind}' has neither a name nor a base")]
    MissingNameAndBase { kind: String },
    #[error("Key '{key}' of '{name}' must be {expected}")]
    InvalidShape {
        name: String,
        key: String,
        expected: String,
    },
    #[error("Invalid {kind} entry '{name}': {reason}")]
    InvalidEntry {
        kind: String,
        name: String,
        reason: String,
    },
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),
    #[error("Edge not defined: {from}->{to}")]
    UndefinedEdge { from: String, to: String },
    #[error("Dependency cycle between nodes: {}", nodes.join(", "))]
    DependencyCycle { nodes: Vec<String> },
    #[error("File system label '{0}' used more than once")]
    DuplicateLabel(String),
    #[error("Label '{label}' too long for filesystem '{fs_type}': {length} > {max}")]
    LabelTooLong {
        label: String,
        fs_type: String,
        length: usize,
        max: usize,
    },
    #[error("Mount point '{}' specified more than once", .0.display())]
    DuplicateMountPoint(PathBuf),
    #[error("Unsupported partition table label '{0}', only 'mbr' is supported")]
    UnsupportedLabel(String),
    #[error("Invalid partition type '{0}'")]
    InvalidPartitionType(String),
    #[error("Invalid size '{value}': {reason}")]
    InvalidSize { value: String, reason: String },
    #[error("Base '{base}' in {kind} '{name}' does not match a valid {target}")]
    InvalidReference {
        kind: String,
        name: String,
        base: String,
        target: String,
    },
    #[error("Logical volume '{0}' needs either a size or extents")]
    MissingLogicalVolumeSize(String),
    #[error("No value for '{0}' in the entry or the parameter file")]
    MissingDefault(String),
}

/// One flat configuration entry, keyed by exactly one plugin kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEntry {
    pub kind: PluginKind,
    pub body: Map<String, Value>,
}

impl ConfigEntry {
    pub fn new(kind: PluginKind, body: Map<String, Value>) -> Self {
        Self { kind, body }
    }

    pub fn name(&self) -> Option<&str> {
        self.body.get("name").and_then(Value::as_str)
    }

    /// Base of the entry, when it names a single parent.
    pub fn base(&self) -> Option<&str> {
        self.body.get("base").and_then(Value::as_str)
    }

    /// Deserializes the body into the plugin's typed config.
    pub fn parse<T: de::DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(Value::Object(self.body.clone())).map_err(|e| {
            ConfigError::InvalidEntry {
                kind: self.kind.to_string(),
                name: self.name().unwrap_or("<unnamed>").into(),
                reason: e.to_string(),
            }
        })
    }
}

impl Serialize for ConfigEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.kind, &self.body)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ConfigEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = ConfigEntry;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a single-key mapping from plugin kind to entry")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let (kind, body): (PluginKind, Map<String, Value>) = access
                    .next_entry()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                if access.next_key::<PluginKind>()?.is_some() {
                    return Err(de::Error::invalid_length(2, &self));
                }
                Ok(ConfigEntry { kind, body })
            }
        }

        deserializer.deserialize_map(EntryVisitor)
    }
}

/// Flat, graph-ready configuration as persisted by `init`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatConfig(pub Vec<ConfigEntry>);

impl FlatConfig {
    pub fn entries(&self) -> &[ConfigEntry] {
        &self.0
    }

    /// Finds the mkfs entry holding the root filesystem: the one mounted at `/`, falling back to
    /// the conventional `mkfs_root` name.
    pub fn root_filesystem(&self) -> Option<&ConfigEntry> {
        self.root_filesystem_index().map(|i| &self.0[i])
    }

    pub fn root_filesystem_mut(&mut self) -> Option<&mut ConfigEntry> {
        self.root_filesystem_index().map(move |i| &mut self.0[i])
    }

    fn root_filesystem_index(&self) -> Option<usize> {
        let mounted_at_root: BTreeSet<&str> = self
            .0
            .iter()
            .filter(|e| e.kind == PluginKind::Mount)
            .filter(|e| {
                e.body.get("mount_point").and_then(Value::as_str) == Some(ROOT_MOUNT_POINT)
            })
            .filter_map(ConfigEntry::base)
            .collect();

        self.0
            .iter()
            .position(|e| {
                e.kind == PluginKind::Mkfs && e.name().is_some_and(|n| mounted_at_root.contains(n))
            })
            .or_else(|| {
                self.0.iter().position(|e| {
                    e.kind == PluginKind::Mkfs && e.name() == Some(ROOT_FILESYSTEM_NAME)
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use indoc::indoc;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_plugin_kind_names() {
        assert_eq!(PluginKind::LocalLoop.name(), "local_loop");
        assert_eq!(PluginKind::from_str("partitioning"), Ok(PluginKind::Partitioning));
        assert!(PluginKind::from_str("gpt").is_err());
    }

    #[test]
    fn test_entry_round_trip() {
        let entry: ConfigEntry = serde_json::from_value(json!({
            "mkfs": {"name": "root_fs", "base": "root", "type": "xfs"}
        }))
        .unwrap();
        assert_eq!(entry.kind, PluginKind::Mkfs);
        assert_eq!(entry.name(), Some("root_fs"));
        assert_eq!(entry.base(), Some("root"));
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"mkfs": {"name": "root_fs", "base": "root", "type": "xfs"}})
        );
    }

    #[test]
    fn test_entry_rejects_multiple_keys() {
        let result: Result<ConfigEntry, _> = serde_json::from_value(json!({
            "mkfs": {"name": "a"},
            "mount": {"name": "b"}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_root_filesystem() {
        let config: FlatConfig = serde_yaml::from_str(indoc! {r#"
            - local_loop:
                name: image0
            - mkfs:
                name: data_fs
                base: image0
            - mkfs:
                name: sys_fs
                base: image0
            - mount:
                name: mount_sys_fs
                base: sys_fs
                mount_point: /
        "#})
        .unwrap();
        assert_eq!(config.root_filesystem().unwrap().name(), Some("sys_fs"));

        let config: FlatConfig = serde_yaml::from_str(indoc! {r#"
            - mkfs:
                name: mkfs_root
                base: image0
        "#})
        .unwrap();
        assert_eq!(config.root_filesystem().unwrap().name(), Some("mkfs_root"));
    }
}
