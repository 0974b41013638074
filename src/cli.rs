use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use strum_macros::{Display, IntoStaticStr};

use blockdev_api::constants::PARAMS_ENV;

use crate::BLOCKDEV_VERSION;

#[derive(Parser, Debug)]
#[clap(version = BLOCKDEV_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Debug)]
    pub verbosity: LevelFilter,

    /// Parameter file naming the build directory, the layout and its defaults
    #[arg(global = true, short, long, env = PARAMS_ENV)]
    pub params: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Commands {
    /// Compile the layout and persist it for the later phases
    Init,

    /// Create every block device, filesystem and mount of the layout
    Create,

    /// Print one value of the persisted config or state
    Getval {
        #[clap(index = 1)]
        symbol: GetvalSymbol,
    },

    /// Render the fstab of the image and install it into the build tree
    Writefstab,

    /// Unmount filesystems and deactivate devices, keeping the image
    Umount,

    /// Release what is left after umount and forget the state
    Cleanup,

    /// Like cleanup, also removing the image
    Delete,
}

/// Values `getval` can print.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum GetvalSymbol {
    RootLabel,
    RootFstype,
    MountPoints,
    ImagePath,
    ImageBlockDevice,
    ImageBlockDevices,
}
