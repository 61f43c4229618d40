//! Process signal delivery through `signal-hook`.
//!
//! Each watched signal gets its own socket pair. `signal-hook` owns the write
//! end and sends a byte into it from its handler; the reactor polls the read
//! end. The handler is async-signal-safe and leaves `errno` as it found it.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use signal_hook::consts::FORBIDDEN;
use signal_hook::low_level::{self, pipe};
use signal_hook::SigId;

/// One signal routed into a pollable socket.
pub(crate) struct SignalSource {
    signo: i32,
    read: UnixStream,
    id: SigId,
}

impl SignalSource {
    pub(crate) fn new(signo: i32) -> io::Result<Self> {
        // signal-hook panics on these instead of returning an error.
        if signo <= 0 || FORBIDDEN.contains(&signo) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("signal {signo} cannot be watched"),
            ));
        }
        let (read, write) = UnixStream::pair()?;
        read.set_nonblocking(true)?;
        let id = pipe::register(signo, write)?;
        Ok(SignalSource { signo, read, id })
    }

    pub(crate) fn signo(&self) -> i32 {
        self.signo
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Empty the socket. Returns whether any delivery was pending.
    pub(crate) fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut delivered = false;
        loop {
            match (&self.read).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => delivered = true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        delivered
    }
}

impl Drop for SignalSource {
    fn drop(&mut self) {
        low_level::unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_hook::consts::{SIGKILL, SIGSTOP, SIGURG, SIGWINCH};

    #[test]
    fn refuses_unwatchable_signals() {
        for signo in [0, -1, SIGKILL, SIGSTOP] {
            let err = SignalSource::new(signo).err().unwrap();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "signal {signo}");
        }
    }

    #[test]
    fn every_source_of_a_signal_is_woken() {
        let a = SignalSource::new(SIGURG).unwrap();
        let b = SignalSource::new(SIGURG).unwrap();
        assert!(!a.drain());

        low_level::raise(SIGURG).unwrap();
        assert!(a.drain());
        assert!(b.drain());
        assert_eq!(a.signo(), SIGURG);
    }

    #[test]
    fn delivery_into_a_full_socket_keeps_errno() {
        let source = SignalSource::new(SIGWINCH).unwrap();

        // Fill the socket so later sends from the handler fail.
        for _ in 0..4096 {
            low_level::raise(SIGWINCH).unwrap();
        }

        let missing = std::fs::File::open("/nonexistent/tau-coop").unwrap_err();
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);
        low_level::raise(SIGWINCH).unwrap();
        assert_eq!(io::Error::last_os_error().kind(), io::ErrorKind::NotFound);

        assert!(source.drain());
    }
}
