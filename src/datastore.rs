use std::{
    fs,
    io::ErrorKind as IoErrorKind,
    path::{Path, PathBuf},
};

use log::{debug, info};
use serde::{de::DeserializeOwned, Serialize};

use blockdev_api::{
    config::FlatConfig,
    error::{BlockDeviceError, InternalError, ReportError, StateError},
    state::SharedState,
};

const CONFIG_FILE: &str = "config.json";
const STATE_FILE: &str = "state.json";
const CALL_ORDER_FILE: &str = "call-order.json";
const DEBUG_DUMP_FILE: &str = "state-debug.json";
const FSTAB_FILE: &str = "fstab";

/// Everything a phase leaves behind for the next one: the flat config, the shared state and the
/// order nodes were created in.
pub struct StateDir {
    path: PathBuf,
}

impl StateDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fstab_path(&self) -> PathBuf {
        self.path.join(FSTAB_FILE)
    }

    pub fn write_config(&self, config: &FlatConfig) -> Result<(), BlockDeviceError> {
        self.write_json(CONFIG_FILE, config)
    }

    pub fn read_config(&self) -> Result<FlatConfig, BlockDeviceError> {
        self.read_json(CONFIG_FILE)?.structured(StateError::ConfigNotFound {
            path: self.path.join(CONFIG_FILE).display().to_string(),
        })
    }

    pub fn write_state(&self, state: &SharedState) -> Result<(), BlockDeviceError> {
        self.write_json(STATE_FILE, state)
    }

    /// The state written by a successful `create`, if there is one.
    pub fn read_state(&self) -> Result<Option<SharedState>, BlockDeviceError> {
        self.read_json(STATE_FILE)
    }

    /// Like [`StateDir::read_state`], but a missing state is an error.
    pub fn require_state(&self) -> Result<SharedState, BlockDeviceError> {
        self.read_state()?.structured(StateError::StateNotFound {
            path: self.path.join(STATE_FILE).display().to_string(),
        })
    }

    pub fn write_call_order(&self, order: &[String]) -> Result<(), BlockDeviceError> {
        self.write_json(CALL_ORDER_FILE, &order)
    }

    pub fn read_call_order(&self) -> Result<Vec<String>, BlockDeviceError> {
        self.read_json(CALL_ORDER_FILE)?
            .structured(StateError::StateNotFound {
                path: self.path.join(CALL_ORDER_FILE).display().to_string(),
            })
    }

    /// Post-mortem of a failed `create`. Never read back.
    pub fn write_debug_dump(&self, dump: &impl Serialize) -> Result<(), BlockDeviceError> {
        self.write_json(DEBUG_DUMP_FILE, dump)
    }

    pub fn remove(&self) -> Result<(), BlockDeviceError> {
        info!("Removing state directory '{}'", self.path.display());
        match fs::remove_dir_all(&self.path) {
            Err(e) if e.kind() != IoErrorKind::NotFound => {
                Err(e).structured(StateError::RemoveStateDir {
                    path: self.path.display().to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn write_json(&self, name: &str, value: &impl Serialize) -> Result<(), BlockDeviceError> {
        let path = self.path.join(name);
        debug!("Writing '{}'", path.display());
        let contents =
            serde_json::to_string_pretty(value).structured(InternalError::SerializeState)?;
        fs::create_dir_all(&self.path)
            .and_then(|()| fs::write(&path, contents))
            .structured(StateError::Write {
                path: path.display().to_string(),
            })
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, BlockDeviceError> {
        let path = self.path.join(name);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).structured(StateError::Read {
                    path: path.display().to_string(),
                })
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .structured(StateError::Parse {
                path: path.display().to_string(),
            })
    }
}
