// Purpose: CLI entry point mounting the emulated sysfs GPIO tree.

//! Mounts the compatibility tree and serves it until unmounted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fuser::MountOption;
use log::info;

use gpiofs::sysfs::fuse::{GpioFs, NotifierWaker};
use gpiofs::sysfs::hotplug::{self, HotplugMonitor};
use gpiofs::{CdevBackend, GpioProxy};

#[derive(Debug, Parser)]
#[command(version, about = "Emulate the legacy /sys/class/gpio tree over GPIO character devices")]
struct Cli {
    /// Directory where the emulated tree is mounted.
    mountpoint: PathBuf,

    /// Allow other users to access the mount (needs `user_allow_other` in
    /// /etc/fuse.conf when running unprivileged).
    #[arg(long)]
    allow_other: bool,

    /// Unmount automatically when the process exits.
    #[arg(long)]
    auto_unmount: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let proxy = GpioProxy::new(Arc::new(CdevBackend), cli.mountpoint.clone())
        .context("start emulation core")?;
    hotplug::snapshot(&proxy).context("enumerate gpio chips")?;
    let monitor = HotplugMonitor::spawn(proxy.clone()).context("subscribe to gpio hotplug")?;

    let mut options = vec![
        MountOption::FSName("gpiofs".into()),
        MountOption::Subtype("gpiofs".into()),
        MountOption::DefaultPermissions,
    ];
    if cli.allow_other {
        options.push(MountOption::AllowOther);
    }
    if cli.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    let mut session = fuser::Session::new(GpioFs::new(proxy.clone()), &cli.mountpoint, &options)
        .with_context(|| format!("mount {}", cli.mountpoint.display()))?;
    proxy.set_waker(Arc::new(NotifierWaker::new(session.notifier())));

    info!("serving {}", cli.mountpoint.display());
    let outcome = session.run().context("filesystem session");

    monitor.stop();
    proxy.shutdown();
    outcome
}
