use std::{panic, process::ExitCode};

use clap::Parser;
use log::{error, info};

use blockdev::{
    cli::{Cli, Commands},
    BlockDevice, BLOCKDEV_VERSION,
};
use blockdev_api::error::{
    BlockDeviceError, BlockDeviceResultExt, InternalError, InvalidInputError,
};
use osutils::dependencies::HostExecutor;

fn run(args: &Cli) -> Result<(), BlockDeviceError> {
    info!("blockdev version: {BLOCKDEV_VERSION}");

    let params = args
        .params
        .as_ref()
        .ok_or_else(|| BlockDeviceError::new(InvalidInputError::MissingParams))?;
    let exec = HostExecutor::new();

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let blockdev = BlockDevice::load(params, &exec)?;
        match args.command {
            Commands::Init => blockdev.init(),
            Commands::Create => blockdev.create(),
            Commands::Getval { symbol } => blockdev.getval(symbol).map(|value| println!("{value}")),
            Commands::Writefstab => blockdev.writefstab(),
            Commands::Umount => blockdev.umount(),
            Commands::Cleanup => blockdev.cleanup(),
            Commands::Delete => blockdev.delete(),
        }
    }));

    match res {
        Err(e) => Err(BlockDeviceError::new(InternalError::Panic(format!("{e:?}")))),
        Ok(r) => r.message(format!("Failed to execute '{}' phase", args.command)),
    }
}

fn main() -> ExitCode {
    let args = Cli::parse();

    // Logs go to stderr so getval output stays clean.
    if let Err(e) = env_logger::builder()
        .format_timestamp(None)
        .filter_level(args.verbosity)
        .try_init()
    {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    if let Err(e) = run(&args) {
        error!("blockdev failed: {e:?}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
