use std::ffi::CString;
use std::io::{self, Write};

use crate::opt;
use crate::spin_lock::SpinLock;
use crate::syscall;

pub struct RawFile {
    fd: libc::c_int,
    owned: bool,
}

impl RawFile {
    pub fn create(path: &str) -> io::Result<Self> {
        let path =
            CString::new(path).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let fd = syscall::open(
            &path,
            libc::O_CLOEXEC | libc::O_CREAT | libc::O_TRUNC | libc::O_WRONLY,
            0o644,
        );

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(RawFile { fd, owned: true })
    }

    pub fn stderr() -> Self {
        RawFile {
            fd: 2,
            owned: false,
        }
    }
}

impl Drop for RawFile {
    #[inline]
    fn drop(&mut self) {
        if self.owned {
            syscall::close(self.fd);
        }
    }
}

impl Write for RawFile {
    #[inline]
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
        let count = syscall::write(self.fd, buffer);
        if count < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(count as usize)
        }
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

static SINK: SpinLock<Option<RawFile>> = SpinLock::new(None);

/// Opens the report destination once. Degrades to stderr (with a logged
/// warning) when the file cannot be created.
pub fn initialize() {
    let path = match opt::get().outfile {
        Some(ref path) => format!("{}.{}", path, *crate::PID),
        None => return,
    };

    match RawFile::create(&path) {
        Ok(file) => {
            info!("Report output: {}", path);
            *SINK.lock() = Some(file);
        }
        Err(error) => {
            warn!("Failed to open report output {}: {}; using stderr", path, error);
        }
    }
}

/// Runs `callback` with exclusive access to the report destination, so
/// concurrent dumps never interleave their lines.
pub fn with<R, F: FnOnce(&mut dyn Write) -> R>(callback: F) -> R {
    let mut sink = SINK.lock();
    match sink.as_mut() {
        Some(file) => callback(file),
        None => {
            let mut stderr = RawFile::stderr();
            callback(&mut stderr)
        }
    }
}
