//! A file-backed reference backend (§4.5.1) over a `std::fs::File`. Suited
//! to the single-threaded cooperative model (§5): operations are issued and
//! completed inline, with no OS-level asynchrony, which is sufficient since
//! "asynchronous" here means "callback-driven", not "threaded".

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use bq_error::{QueueError, Result};
use parking_lot::Mutex;
use tracing::trace;

use crate::backend::{Backend, Completion};
use crate::flags::OpenFlags;

/// A backend over a single open file, synchronized by an internal mutex.
pub struct FileBackend {
    file: Mutex<File>,
    open_flags: OpenFlags,
}

impl FileBackend {
    /// Wrap an already-open file.
    #[must_use]
    pub fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
            open_flags: OpenFlags::empty(),
        }
    }

    /// Wrap an already-open file in write-through mode (§6).
    #[must_use]
    pub fn new_writethrough(file: File) -> Self {
        Self {
            file: Mutex::new(file),
            open_flags: OpenFlags::WRITETHROUGH,
        }
    }
}

impl Backend for FileBackend {
    fn sync_pread(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        let mut buf = vec![0_u8; size];
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| QueueError::Backend { code: io_code(&e) })?;
        let mut filled = 0;
        while filled < size {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(QueueError::Backend { code: io_code(&e) }),
            }
        }
        buf.truncate(filled);
        buf.resize(size, 0);
        trace!(offset, size, "file backend sync_pread");
        Ok(buf)
    }

    fn async_pwrite(&self, offset: u64, buf: Vec<u8>, completion: Completion) {
        let ret = {
            let mut file = self.file.lock();
            match file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| file.write_all(&buf))
            {
                Ok(()) => 0,
                Err(e) => -i64::from(io_code(&e)),
            }
        };
        trace!(offset, len = buf.len(), ret, "file backend async_pwrite");
        completion(ret);
    }

    fn async_flush(&self, completion: Completion) {
        let ret = {
            let file = self.file.lock();
            match file.sync_data() {
                Ok(()) => 0,
                Err(e) => -i64::from(io_code(&e)),
            }
        };
        trace!(ret, "file backend async_flush");
        completion(ret);
    }

    fn open_flags(&self) -> OpenFlags {
        self.open_flags
    }
}

/// The raw OS errno (positive), unknown errors fall back to `-1`. Callers
/// negate this before handing it to a [`Completion`], per the `Backend`
/// contract of 0-or-negative completion codes.
fn io_code(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_reads_back() {
        let tmp = tempfile::tempfile().expect("tempfile");
        tmp.set_len(4096).expect("set_len");
        let backend = FileBackend::new(tmp);

        backend.async_pwrite(100, vec![7; 16], Box::new(|ret| assert_eq!(ret, 0)));
        let data = backend.sync_pread(100, 16).expect("pread");
        assert_eq!(data, vec![7; 16]);
    }

    #[test]
    fn flush_reports_success() {
        let tmp = tempfile::tempfile().expect("tempfile");
        let backend = FileBackend::new(tmp);
        let observed = std::sync::Arc::new(std::sync::Mutex::new(None));
        let observed2 = std::sync::Arc::clone(&observed);
        backend.async_flush(Box::new(move |ret| *observed2.lock().unwrap() = Some(ret)));
        assert_eq!(*observed.lock().unwrap(), Some(0));
    }

    #[test]
    fn write_failure_completes_with_a_negative_code() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("bq-file-backend-test-{:?}", std::thread::current().id()));
        std::fs::write(&path, b"seed").expect("write seed file");
        let file = std::fs::OpenOptions::new().read(true).open(&path).expect("open read-only");
        let backend = FileBackend::new(file);

        backend.async_pwrite(
            0,
            vec![1, 2, 3],
            Box::new(|ret| assert!(ret < 0, "write failure must complete with a negative code, got {ret}")),
        );

        std::fs::remove_file(&path).ok();
    }
}
