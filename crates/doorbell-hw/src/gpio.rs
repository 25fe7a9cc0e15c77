//! Linux sysfs GPIO pins.
//!
//! Pins are exported through `/sys/class/gpio/export` and driven through
//! their `value` attribute. Inputs are configured with `edge = both`, so a
//! `poll(2)` on the value file wakes with `POLLPRI` on every level change.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("failed to export gpio{pin}: {source}")]
    Export { pin: u32, source: std::io::Error },
    #[error("failed to configure gpio{pin} {attribute}: {source}")]
    Configure {
        pin: u32,
        attribute: &'static str,
        source: std::io::Error,
    },
    #[error("failed to open gpio{pin} value: {source}")]
    Open { pin: u32, source: std::io::Error },
    #[error("gpio{pin} read failed: {source}")]
    Read { pin: u32, source: std::io::Error },
    #[error("gpio{pin} poll failed: {source}")]
    Poll { pin: u32, source: std::io::Error },
    #[error("failed to spawn watcher for gpio{pin}: {source}")]
    Spawn { pin: u32, source: std::io::Error },
}

/// An exported pin directory under the sysfs root.
#[derive(Debug, Clone)]
struct Pin {
    number: u32,
    dir: PathBuf,
}

impl Pin {
    fn export(root: &Path, number: u32) -> Result<Self, GpioError> {
        let dir = root.join(format!("gpio{number}"));
        if !dir.exists() {
            std::fs::write(root.join("export"), number.to_string())
                .map_err(|source| GpioError::Export { pin: number, source })?;
        }
        Ok(Self { number, dir })
    }

    fn configure(&self, attribute: &'static str, value: &str) -> Result<(), GpioError> {
        std::fs::write(self.dir.join(attribute), value).map_err(|source| GpioError::Configure {
            pin: self.number,
            attribute,
            source,
        })
    }

    fn open_value(&self, write: bool) -> Result<File, GpioError> {
        File::options()
            .read(true)
            .write(write)
            .open(self.dir.join("value"))
            .map_err(|source| GpioError::Open {
                pin: self.number,
                source,
            })
    }
}

/// A pin driven as a digital output.
#[derive(Debug)]
pub struct OutputPin {
    pin: Pin,
    value: File,
}

impl OutputPin {
    pub fn open(root: &Path, number: u32) -> Result<Self, GpioError> {
        let pin = Pin::export(root, number)?;
        pin.configure("direction", "out")?;
        let value = pin.open_value(true)?;
        Ok(Self { pin, value })
    }

    pub fn number(&self) -> u32 {
        self.pin.number
    }

    pub fn set(&mut self, on: bool) -> std::io::Result<()> {
        self.value.seek(SeekFrom::Start(0))?;
        self.value.write_all(if on { b"1" } else { b"0" })?;
        self.value.flush()
    }
}

/// A pin read as a digital input with both-edge notification.
///
/// The pin is configured active-low, so a button pulled up to 3.3V and
/// shorted to ground reads `true` while pressed.
#[derive(Debug)]
pub struct InputPin {
    pin: Pin,
    value: File,
}

impl InputPin {
    pub fn open(root: &Path, number: u32) -> Result<Self, GpioError> {
        let pin = Pin::export(root, number)?;
        pin.configure("direction", "in")?;
        pin.configure("active_low", "1")?;
        pin.configure("edge", "both")?;
        let value = pin.open_value(false)?;
        Ok(Self { pin, value })
    }

    pub fn number(&self) -> u32 {
        self.pin.number
    }

    /// Current logical level (`true` = pressed).
    pub fn is_active(&mut self) -> Result<bool, GpioError> {
        let read_err = |source| GpioError::Read {
            pin: self.pin.number,
            source,
        };
        let mut buf = [0u8; 1];
        self.value.seek(SeekFrom::Start(0)).map_err(read_err)?;
        self.value.read_exact(&mut buf).map_err(read_err)?;
        Ok(buf[0] == b'1')
    }

    /// Block until the kernel reports an edge or `timeout` expires.
    ///
    /// Returns the level after the edge, or `None` on timeout.
    pub fn wait_edge(&mut self, timeout: Duration) -> Result<Option<bool>, GpioError> {
        let mut fds = libc::pollfd {
            fd: self.value.as_raw_fd(),
            events: libc::POLLPRI | libc::POLLERR,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        // SAFETY:
        // - `fds` is a single valid pollfd and nfds is 1
        // - the fd stays open for the lifetime of `self.value`
        let ret = unsafe { libc::poll(&mut fds, 1, timeout_ms) };

        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(GpioError::Poll {
                pin: self.pin.number,
                source: err,
            });
        }
        if ret == 0 {
            return Ok(None);
        }
        self.is_active().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake sysfs tree with the pin directory already exported.
    fn fake_root(pins: &[u32]) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("export"), "").unwrap();
        for pin in pins {
            let dir = root.path().join(format!("gpio{pin}"));
            std::fs::create_dir(&dir).unwrap();
            std::fs::write(dir.join("value"), "0").unwrap();
        }
        root
    }

    #[test]
    fn test_output_pin_writes_value_and_direction() {
        let root = fake_root(&[4]);
        let mut pin = OutputPin::open(root.path(), 4).unwrap();
        pin.set(true).unwrap();

        let dir = root.path().join("gpio4");
        assert_eq!(std::fs::read_to_string(dir.join("direction")).unwrap(), "out");
        assert_eq!(std::fs::read_to_string(dir.join("value")).unwrap(), "1");

        pin.set(false).unwrap();
        assert_eq!(std::fs::read_to_string(dir.join("value")).unwrap(), "0");
    }

    #[test]
    fn test_input_pin_configures_edges() {
        let root = fake_root(&[27]);
        let mut pin = InputPin::open(root.path(), 27).unwrap();

        let dir = root.path().join("gpio27");
        assert_eq!(std::fs::read_to_string(dir.join("direction")).unwrap(), "in");
        assert_eq!(std::fs::read_to_string(dir.join("edge")).unwrap(), "both");
        assert_eq!(std::fs::read_to_string(dir.join("active_low")).unwrap(), "1");
        assert!(!pin.is_active().unwrap());

        std::fs::write(dir.join("value"), "1").unwrap();
        assert!(pin.is_active().unwrap());
    }

    #[test]
    fn test_export_requested_for_unexported_pin() {
        let root = fake_root(&[]);
        let result = OutputPin::open(root.path(), 6);
        // The fake root has no kernel behind it, so the pin directory never appears.
        assert!(matches!(result, Err(GpioError::Configure { pin: 6, .. })));
        assert_eq!(std::fs::read_to_string(root.path().join("export")).unwrap(), "6");
    }
}
