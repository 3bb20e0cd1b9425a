//! Jobserver client: reads `MAKEFLAGS`, acquires and releases tokens.
//! Supports the FIFO and inherited-fd-pair POSIX modes; the Win32
//! named-semaphore mode has no POSIX equivalent and isn't implemented here.

use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobserverMode {
    None,
    Fifo(std::path::PathBuf),
    FdPair(RawFd, RawFd),
}

pub fn parse_makeflags(makeflags: &str) -> JobserverMode {
    for tok in makeflags.split_whitespace() {
        let Some(rest) = tok.strip_prefix("--jobserver-auth=").or_else(|| tok.strip_prefix("--jobserver-fds=")) else {
            continue;
        };
        if let Some(path) = rest.strip_prefix("fifo:") {
            return JobserverMode::Fifo(std::path::PathBuf::from(path));
        }
        if let Some((r, w)) = rest.split_once(',') {
            if let (Ok(r), Ok(w)) = (r.parse::<RawFd>(), w.parse::<RawFd>()) {
                return JobserverMode::FdPair(r, w);
            }
        }
    }
    JobserverMode::None
}

fn set_nonblocking(f: &File) {
    let fd = f.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

/// A single acquired token. The implicit slot every process gets by
/// convention doesn't need one of these; only concurrency beyond the first
/// running child does. Dropping writes the byte back to the pool.
pub struct Slot {
    byte: u8,
    write_fd: RawFd,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let buf = [self.byte];
        unsafe {
            libc::write(self.write_fd, buf.as_ptr() as *const _, 1);
        }
    }
}

pub struct Jobserver {
    read_fd: Option<File>,
    write_fd: Option<File>,
}

impl Jobserver {
    pub fn from_env() -> Self {
        let mode = std::env::var("MAKEFLAGS").map(|v| parse_makeflags(&v)).unwrap_or(JobserverMode::None);
        Self::from_mode(mode)
    }

    pub fn from_mode(mode: JobserverMode) -> Self {
        let (read_fd, write_fd) = match mode {
            JobserverMode::Fifo(path) => {
                let r = std::fs::OpenOptions::new().read(true).open(&path).ok();
                let w = std::fs::OpenOptions::new().write(true).open(&path).ok();
                (r, w)
            }
            JobserverMode::FdPair(r, w) => unsafe { (Some(File::from_raw_fd(r)), Some(File::from_raw_fd(w))) },
            JobserverMode::None => (None, None),
        };
        Self { read_fd, write_fd }
    }

    pub fn is_active(&self) -> bool {
        self.read_fd.is_some() && self.write_fd.is_some()
    }

    /// Non-blocking: `None` means no token is available right now, not an
    /// error — the caller should fall back to the implicit slot.
    pub fn try_acquire(&mut self) -> Option<Slot> {
        let read_fd = self.read_fd.as_ref()?;
        let write_fd = self.write_fd.as_ref()?.as_raw_fd();
        set_nonblocking(read_fd);
        let mut buf = [0u8; 1];
        match (&*read_fd).read(&mut buf) {
            Ok(1) => Some(Slot { byte: buf[0], write_fd }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(res, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn fifo_makeflags_parsed() {
        let mode = parse_makeflags("-j4 --jobserver-auth=fifo:/tmp/x.fifo");
        assert_eq!(mode, JobserverMode::Fifo(std::path::PathBuf::from("/tmp/x.fifo")));
    }

    #[test]
    fn fd_pair_makeflags_parsed() {
        let (r, w) = make_pipe();
        let mode = parse_makeflags(&format!("--jobserver-auth={r},{w}"));
        assert_eq!(mode, JobserverMode::FdPair(r, w));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn no_jobserver_token_when_makeflags_is_absent() {
        assert_eq!(parse_makeflags("-j4"), JobserverMode::None);
    }

    #[test]
    fn acquire_and_release_round_trips_a_token() {
        let (r, w) = make_pipe();
        unsafe {
            let token = [b'X'];
            libc::write(w, token.as_ptr() as *const _, 1);
        }
        let mut js = Jobserver::from_mode(JobserverMode::FdPair(r, w));
        let slot = js.try_acquire().expect("token available");
        assert!(js.try_acquire().is_none(), "only one token was available");
        drop(slot);
        assert!(js.try_acquire().is_some(), "releasing a slot returns the token to the pool");
    }
}
