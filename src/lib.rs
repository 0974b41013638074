use std::path::Path;

use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;

use blockdev_api::{
    config::{config_tree_to_graph, plugins::filesystem_label, FlatConfig, Params},
    constants::{
        state_keys, BUILT_ETC_RELATIVE_PATH, DEFAULT_CONFIG, DEFAULT_ROOT_FS_TYPE,
        DEFAULT_ROOT_LABEL, IMAGE_NAME,
    },
    error::{
        BlockDeviceError, BlockDeviceResultExt, ExecutionError, InvalidInputError, ReportError,
        StateError,
    },
    state::{BlockDeviceRecord, FilesystemRecord, FstabRecord, MountRecord, SharedState},
};
use osutils::{
    dependencies::Executor,
    files,
    tabfile::{TabDevice, TabFile, TabFileEntry},
};

pub mod cli;
mod datastore;
mod engine;

pub use cli::GetvalSymbol;
pub use datastore::StateDir;
pub use engine::TeardownPhase;

use engine::{rollback::RollbackStack, NodeContext, TeardownContext};

pub const BLOCKDEV_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Written to `state-debug.json` when `create` fails.
#[derive(Serialize)]
struct FailureDump<'a> {
    failed_node: &'a str,
    error: &'a BlockDeviceError,
    state: &'a SharedState,
    /// Undo actions per created node, in creation order.
    rollback: Vec<(&'a str, &'a RollbackStack)>,
}

/// Runs the phases of one image build. Each phase is a separate process; they share nothing but
/// the state directory.
pub struct BlockDevice<'a> {
    params: Params,
    exec: &'a dyn Executor,
    state_dir: StateDir,
}

impl<'a> BlockDevice<'a> {
    pub fn new(params: Params, exec: &'a dyn Executor) -> Self {
        let state_dir = StateDir::new(params.state_dir());
        Self {
            params,
            exec,
            state_dir,
        }
    }

    /// Loads the parameter file at `path`.
    pub fn load(path: impl AsRef<Path>, exec: &'a dyn Executor) -> Result<Self, BlockDeviceError> {
        Ok(Self::new(Params::load(path)?, exec))
    }

    pub fn state_dir(&self) -> &StateDir {
        &self.state_dir
    }

    /// Compiles the layout, fills in the root filesystem defaults and persists the flat config.
    pub fn init(&self) -> Result<(), BlockDeviceError> {
        let tree: Value = match &self.params.config {
            Some(path) => {
                info!("Loading block device configuration from '{}'", path.display());
                let contents =
                    std::fs::read_to_string(path).structured(InvalidInputError::LoadConfig {
                        path: path.display().to_string(),
                    })?;
                serde_yaml::from_str(&contents).structured(InvalidInputError::ParseConfig)?
            }
            None => {
                info!("No block device configuration given, using the default layout");
                serde_yaml::from_str(DEFAULT_CONFIG).structured(InvalidInputError::ParseConfig)?
            }
        };

        let mut config = config_tree_to_graph(&tree)?;
        self.merge_root_defaults(&mut config);
        debug!("Flat configuration: {config:?}");

        self.state_dir.write_config(&config)
    }

    fn merge_root_defaults(&self, config: &mut FlatConfig) {
        let Some(root) = config.root_filesystem_mut() else {
            warn!("No root filesystem in the layout, not applying root defaults");
            return;
        };

        let defaults = [
            (
                "type",
                Some(
                    self.params
                        .root_fs_type
                        .as_deref()
                        .unwrap_or(DEFAULT_ROOT_FS_TYPE),
                ),
            ),
            (
                "label",
                Some(
                    self.params
                        .root_label
                        .as_deref()
                        .unwrap_or(DEFAULT_ROOT_LABEL),
                ),
            ),
            ("opts", self.params.root_fs_opts.as_deref()),
        ];
        for (key, value) in defaults {
            if let Some(value) = value {
                root.body
                    .entry(key)
                    .or_insert_with(|| Value::String(value.into()));
            }
        }
    }

    /// Creates everything in graph order. On failure, every undo action registered so far runs,
    /// newest first, and the original error is returned.
    pub fn create(&self) -> Result<(), BlockDeviceError> {
        let config = self.state_dir.read_config()?;
        let graph = engine::create_graph(&config, &self.params)?;

        let mut state = SharedState::new();
        let mut stacks: Vec<(&str, RollbackStack)> = Vec::new();
        for node in graph.nodes() {
            info!("Creating '{}'", node.name());
            let mut rollback = RollbackStack::default();
            let result = node.create(&mut NodeContext {
                params: &self.params,
                state: &mut state,
                exec: self.exec,
                rollback: &mut rollback,
            });
            stacks.push((node.name(), rollback));

            if let Err(e) = result.message(format!("Node '{}' failed during create", node.name())) {
                error!("Creating '{}' failed, rolling back", node.name());
                return Err(self.roll_back(e, node.name(), &state, stacks));
            }
        }

        self.state_dir.write_state(&state)?;
        self.state_dir.write_call_order(&graph.call_order())?;
        info!("Created {} nodes", graph.nodes().len());
        Ok(())
    }

    fn roll_back(
        &self,
        mut error: BlockDeviceError,
        failed_node: &str,
        state: &SharedState,
        mut stacks: Vec<(&str, RollbackStack)>,
    ) -> BlockDeviceError {
        let dump = FailureDump {
            failed_node,
            error: &error,
            state,
            rollback: stacks.iter().map(|(name, stack)| (*name, stack)).collect(),
        };
        if let Err(e) = self.state_dir.write_debug_dump(&dump) {
            error!("Failed to write state dump: {e:?}");
        }

        // The failing node is last, so its own actions run first.
        for (name, stack) in stacks.iter_mut().rev() {
            if stack.is_empty() {
                continue;
            }
            info!("Rolling back '{name}'");
            for failure in stack.unwind(self.exec) {
                error = error.secondary_error_context(failure);
            }
        }
        error
    }

    /// Walks the graph in reverse, calling `phase` on every node. Failing nodes do not stop the
    /// walk; the first error is returned with the later ones attached.
    pub fn teardown(&self, phase: TeardownPhase) -> Result<(), BlockDeviceError> {
        let state = match self.state_dir.read_state()? {
            Some(state) => state,
            None if phase == TeardownPhase::Umount => {
                info!("No state found, nothing to unmount");
                return Ok(());
            }
            None => return self.state_dir.require_state().map(|_| ()),
        };

        let config = self.state_dir.read_config()?;
        let graph = engine::create_graph(&config, &self.params)?;
        if graph.call_order() != self.state_dir.read_call_order()? {
            return Err(BlockDeviceError::new(StateError::CallOrderMismatch));
        }

        let ctx = TeardownContext {
            params: &self.params,
            state: &state,
            exec: self.exec,
        };
        let mut first_error: Option<BlockDeviceError> = None;
        for node in graph.nodes().iter().rev() {
            debug!("Running {phase} of '{}'", node.name());
            let result = node
                .teardown(phase, &ctx)
                .message(format!("Node '{}' failed during {phase}", node.name()));
            if let Err(e) = result {
                error!("{phase} of '{}' failed: {e:?}", node.name());
                first_error = Some(match first_error {
                    None => e,
                    Some(first) => first.secondary_error_context(e),
                });
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if phase != TeardownPhase::Umount {
            self.state_dir.remove()?;
        }
        Ok(())
    }

    pub fn umount(&self) -> Result<(), BlockDeviceError> {
        self.teardown(TeardownPhase::Umount)
    }

    pub fn cleanup(&self) -> Result<(), BlockDeviceError> {
        self.teardown(TeardownPhase::Cleanup)
    }

    pub fn delete(&self) -> Result<(), BlockDeviceError> {
        self.teardown(TeardownPhase::Delete)
    }

    /// Reads one value out of the persisted config or state, without building the graph.
    pub fn getval(&self, symbol: GetvalSymbol) -> Result<String, BlockDeviceError> {
        match symbol {
            GetvalSymbol::RootLabel => {
                let fs_type = self.root_filesystem_value("type")?;
                let label = self.root_filesystem_value("label")?;
                Ok(filesystem_label(&fs_type, &label).into())
            }
            GetvalSymbol::RootFstype => self.root_filesystem_value("type"),
            GetvalSymbol::MountPoints => Ok(self
                .state_dir
                .require_state()?
                .list(state_keys::MOUNT_ORDER)?
                .join(" ")),
            GetvalSymbol::ImagePath => {
                let record: BlockDeviceRecord = self
                    .state_dir
                    .require_state()?
                    .get(state_keys::BLOCKDEV, IMAGE_NAME)?;
                let image = record.image.structured(StateError::MissingKey {
                    namespace: state_keys::BLOCKDEV.into(),
                    key: format!("{IMAGE_NAME}.image"),
                })?;
                Ok(image.display().to_string())
            }
            GetvalSymbol::ImageBlockDevice => Ok(self
                .state_dir
                .require_state()?
                .device_of(IMAGE_NAME)?
                .display()
                .to_string()),
            GetvalSymbol::ImageBlockDevices => {
                let state = self.state_dir.require_state()?;
                let pairs = state
                    .keys(state_keys::BLOCKDEV)
                    .into_iter()
                    .map(|name| {
                        state
                            .device_of(name)
                            .map(|device| format!("{name}:{}", device.display()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(pairs.join(" "))
            }
        }
    }

    fn root_filesystem_value(&self, key: &str) -> Result<String, BlockDeviceError> {
        let config = self.state_dir.read_config()?;
        config
            .root_filesystem()
            .and_then(|entry| entry.body.get(key))
            .and_then(Value::as_str)
            .map(String::from)
            .structured(StateError::MissingKey {
                namespace: "root-filesystem".into(),
                key: key.into(),
            })
    }

    /// Renders the fstab of every mount that has an fstab entry, in mount order, and installs it
    /// as `built/etc/fstab` in the build directory.
    pub fn writefstab(&self) -> Result<(), BlockDeviceError> {
        let state = self.state_dir.require_state()?;

        let mut fstab = TabFile::default();
        for mount_point in state.list(state_keys::MOUNT_ORDER)? {
            let mount: MountRecord = state.get(state_keys::MOUNT, &mount_point)?;
            if !state.contains(state_keys::FSTAB, &mount.name) {
                debug!("No fstab entry for '{mount_point}'");
                continue;
            }
            let options: FstabRecord = state.get(state_keys::FSTAB, &mount.name)?;
            let filesystem: FilesystemRecord = state.get(state_keys::FILESYS, &mount.base)?;

            fstab.entries.push(TabFileEntry {
                device: TabDevice::new(&filesystem.label, &filesystem.uuid),
                mount_point: mount_point.into(),
                fs_type: filesystem.fstype,
                options: options.options,
                dump_freq: options.dump_freq,
                fsck_passno: options.fsck_passno,
            });
        }

        let rendered = self.state_dir.fstab_path();
        fstab
            .write(&rendered)
            .structured(ExecutionError::InstallFstab)?;

        let etc = self.params.build_dir.join(BUILT_ETC_RELATIVE_PATH);
        info!("Installing fstab into '{}'", etc.display());
        files::mkdir_p(self.exec, &etc).structured(ExecutionError::InstallFstab)?;
        files::copy(self.exec, &rendered, etc.join("fstab")).structured(ExecutionError::InstallFstab)
    }
}
