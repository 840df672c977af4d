//! Starting and stopping the PRU through the remoteproc framework.
//!
//! The collector never touches this module; it is the caller's job to have
//! the producer running before a capture and stopped afterwards.
//!
//! ```text
//!   install_firmware(src) ──► /lib/firmware/am335x-pru1-fw
//!   RemoteProc::start()   ──► echo start > /sys/class/remoteproc/<name>/state
//!   RemoteProc::stop()    ──► echo stop  > /sys/class/remoteproc/<name>/state
//! ```

use log::{debug, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// remoteproc instance driving PRU1 on the AM335x.
pub const DEFAULT_REMOTEPROC: &str = "remoteproc2";

/// Where the remoteproc driver looks for PRU1 firmware.
pub const DEFAULT_FIRMWARE_DEST: &str = "/lib/firmware/am335x-pru1-fw";

const SYSFS_REMOTEPROC: &str = "/sys/class/remoteproc";

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("cannot read remoteproc state from {path}: {source}")]
    ReadState {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write '{command}' to {path}: {source}")]
    WriteState {
        path: PathBuf,
        command: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("cannot install firmware {src} to {dest}: {source}")]
    Firmware {
        src: PathBuf,
        dest: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Something that can run the sample producer.
pub trait Coprocessor {
    fn start(&mut self) -> Result<(), LifecycleError>;
    fn stop(&mut self) -> Result<(), LifecycleError>;
}

/// A remoteproc instance controlled through its sysfs `state` file.
#[derive(Debug, Clone)]
pub struct RemoteProc {
    state_path: PathBuf,
}

impl RemoteProc {
    /// The instance `/sys/class/remoteproc/<name>`.
    pub fn new(name: &str) -> Self {
        Self::at(Path::new(SYSFS_REMOTEPROC).join(name).join("state"))
    }

    /// An instance whose `state` file lives at `state_path`.
    pub fn at(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Current state as reported by the kernel (`running`, `offline`, ...).
    pub fn state(&self) -> Result<String, LifecycleError> {
        fs::read_to_string(&self.state_path)
            .map(|s| s.trim().to_string())
            .map_err(|source| LifecycleError::ReadState {
                path: self.state_path.clone(),
                source,
            })
    }

    fn write(&self, command: &'static str) -> Result<(), LifecycleError> {
        fs::write(&self.state_path, command).map_err(|source| LifecycleError::WriteState {
            path: self.state_path.clone(),
            command,
            source,
        })
    }
}

impl Coprocessor for RemoteProc {
    /// No-op if already running; the driver rejects a second `start`.
    fn start(&mut self) -> Result<(), LifecycleError> {
        if self.state()? == "running" {
            debug!("{} already running", self.state_path.display());
            return Ok(());
        }
        self.write("start")?;
        info!("Started co-processor via {}", self.state_path.display());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), LifecycleError> {
        if self.state()? == "offline" {
            debug!("{} already offline", self.state_path.display());
            return Ok(());
        }
        self.write("stop")?;
        info!("Stopped co-processor via {}", self.state_path.display());
        Ok(())
    }
}

/// Copy a firmware image to where the remoteproc driver loads it from.
pub fn install_firmware(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<u64, LifecycleError> {
    let (src, dest) = (src.as_ref(), dest.as_ref());
    let bytes = fs::copy(src, dest).map_err(|source| LifecycleError::Firmware {
        src: src.to_path_buf(),
        dest: dest.to_path_buf(),
        source,
    })?;
    info!("Installed {} bytes of firmware to {}", bytes, dest.display());
    Ok(bytes)
}

/// Keeps a co-processor running; stops it when dropped.
pub struct RunningGuard<C: Coprocessor> {
    coprocessor: C,
}

impl<C: Coprocessor> RunningGuard<C> {
    /// Start `coprocessor` and hold it until the guard drops.
    pub fn start(mut coprocessor: C) -> Result<Self, LifecycleError> {
        coprocessor.start()?;
        Ok(Self { coprocessor })
    }
}

impl<C: Coprocessor> Drop for RunningGuard<C> {
    fn drop(&mut self) {
        if let Err(e) = self.coprocessor.stop() {
            warn!("Failed to stop co-processor: {}", e);
        }
    }
}
