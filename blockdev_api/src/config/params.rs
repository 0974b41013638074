use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    constants::STATE_DIR_RELATIVE_PATH,
    error::{BlockDeviceError, InvalidInputError, ReportError},
    primitives::size::string_or_number,
};

/// Parameter file handed to every phase by the outer build pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Params {
    /// Path of the block device configuration. The built-in layout is used when unset.
    #[serde(default)]
    pub config: Option<PathBuf>,

    pub build_dir: PathBuf,

    #[serde(default, deserialize_with = "string_or_number")]
    pub image_size: Option<String>,

    #[serde(default)]
    pub image_dir: Option<PathBuf>,

    #[serde(default)]
    pub mount_base: Option<PathBuf>,

    #[serde(default)]
    pub root_fs_type: Option<String>,

    #[serde(default)]
    pub root_fs_opts: Option<String>,

    #[serde(default)]
    pub root_label: Option<String>,
}

impl Params {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BlockDeviceError> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).structured(InvalidInputError::LoadParams {
                path: path.display().to_string(),
            })?;
        serde_yaml::from_str(&contents).structured(InvalidInputError::ParseParams)
    }

    /// Directory where config, state and call order are persisted between phases.
    pub fn state_dir(&self) -> PathBuf {
        self.build_dir.join(STATE_DIR_RELATIVE_PATH)
    }
}
