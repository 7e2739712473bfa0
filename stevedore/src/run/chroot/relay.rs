//! Copies data between the caller's stdio and the command's pipes or
//! terminal until the command's output side closes.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

const BUFFER_SIZE: usize = 8192;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RelayState {
    /// Waiting for input.
    Reading,
    /// Holding bytes the sink has not taken yet.
    Writing,
    Closed,
}

/// One direction of the relay.
#[derive(Debug)]
pub(crate) struct Relay {
    label: &'static str,
    source: RawFd,
    sink: RawFd,
    /// Dropped on close so the reader of the sink sees EOF.
    owned_sink: Option<OwnedFd>,
    /// Whether the loop waits for this relay to close.
    required: bool,
    pending: Vec<u8>,
    state: RelayState,
}

impl Relay {
    pub(crate) fn new(label: &'static str, source: RawFd, sink: RawFd) -> Self {
        Self {
            label,
            source,
            sink,
            owned_sink: None,
            required: true,
            pending: Vec::new(),
            state: RelayState::Reading,
        }
    }

    pub(crate) fn owning_sink(mut self, sink: OwnedFd) -> Self {
        self.owned_sink = Some(sink);
        self
    }

    pub(crate) fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub(crate) fn state(&self) -> RelayState {
        self.state
    }

    fn close(&mut self) {
        tracing::debug!(relay = self.label, "Relay closed");
        self.pending.clear();
        self.owned_sink = None;
        self.state = RelayState::Closed;
    }

    fn interest(&self) -> Option<(RawFd, PollFlags)> {
        match self.state {
            RelayState::Reading => Some((self.source, PollFlags::POLLIN)),
            RelayState::Writing => Some((self.sink, PollFlags::POLLOUT)),
            RelayState::Closed => None,
        }
    }

    fn on_readable(&mut self) {
        let mut buf = [0u8; BUFFER_SIZE];
        let n = unsafe { libc::read(self.source, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            self.pending.extend_from_slice(&buf[..n as usize]);
            self.state = RelayState::Writing;
            self.on_writable();
            return;
        }
        if n == 0 {
            self.close();
            return;
        }
        match io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => {}
            // A terminal master reports EIO once every slave is closed.
            _ => self.close(),
        }
    }

    fn on_writable(&mut self) {
        let n = unsafe { libc::write(self.sink, self.pending.as_ptr().cast(), self.pending.len()) };
        if n >= 0 {
            self.pending.drain(..n as usize);
            if self.pending.is_empty() {
                self.state = RelayState::Reading;
            }
            return;
        }
        match io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => {}
            _ => self.close(),
        }
    }
}

fn finished(relays: &[Relay]) -> bool {
    relays
        .iter()
        .filter(|r| r.required)
        .all(|r| r.state == RelayState::Closed)
}

/// Pump every relay until all required ones have closed.
pub(crate) fn pump(relays: &mut [Relay]) -> io::Result<()> {
    while !finished(relays) {
        let interests: Vec<(usize, RawFd, PollFlags)> = relays
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.interest().map(|(fd, flags)| (i, fd, flags)))
            .collect();
        // SAFETY: every descriptor stays open while its relay is not closed.
        let mut fds: Vec<PollFd<'_>> = interests
            .iter()
            .map(|(_, fd, flags)| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, *flags))
            .collect();
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
        let ready: Vec<(usize, PollFlags, PollFlags)> = interests
            .iter()
            .zip(fds.iter())
            .map(|((i, _, wanted), fd)| (*i, *wanted, fd.revents().unwrap_or(PollFlags::empty())))
            .collect();
        drop(fds);

        for (i, wanted, revents) in ready {
            if revents.is_empty() {
                continue;
            }
            let relay = &mut relays[i];
            if wanted.contains(PollFlags::POLLIN) {
                relay.on_readable();
            } else if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                relay.close();
            } else {
                relay.on_writable();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    fn pipe() -> (std::fs::File, std::fs::File) {
        let (r, w) = nix::unistd::pipe().unwrap();
        (std::fs::File::from(r), std::fs::File::from(w))
    }

    #[test]
    fn test_relays_until_eof() {
        let (src_r, mut src_w) = pipe();
        let (mut dst_r, dst_w) = pipe();
        src_w.write_all(b"hello").unwrap();
        drop(src_w);

        let mut relays = vec![Relay::new("out", src_r.as_raw_fd(), dst_w.as_raw_fd())];
        pump(&mut relays).unwrap();
        assert_eq!(relays[0].state(), RelayState::Closed);
        drop(dst_w);

        let mut out = String::new();
        dst_r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_large_transfer_survives_partial_writes() {
        let (src_r, mut src_w) = pipe();
        let (mut dst_r, dst_w) = pipe();
        let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = std::thread::spawn(move || src_w.write_all(&payload).unwrap());
        let reader = std::thread::spawn(move || {
            let mut out = Vec::new();
            dst_r.read_to_end(&mut out).unwrap();
            out
        });

        let mut relays = vec![Relay::new("out", src_r.as_raw_fd(), dst_w.as_raw_fd())];
        pump(&mut relays).unwrap();
        writer.join().unwrap();
        drop(dst_w);
        assert_eq!(reader.join().unwrap(), expected);
    }

    #[test]
    fn test_optional_relay_does_not_hold_loop_and_owned_sink_closes() {
        let (stdin_r, _stdin_w) = pipe();
        let (child_in_r, child_in_w) = pipe();
        let (out_r, out_w) = pipe();
        drop(out_w);
        let (_sink_r, sink_w) = pipe();

        let mut relays = vec![
            Relay::new("stdin", stdin_r.as_raw_fd(), child_in_w.as_raw_fd())
                .owning_sink(OwnedFd::from(child_in_w))
                .optional(),
            Relay::new("stdout", out_r.as_raw_fd(), sink_w.as_raw_fd()),
        ];
        pump(&mut relays).unwrap();
        assert_eq!(relays[1].state(), RelayState::Closed);
        assert_eq!(relays[0].state(), RelayState::Reading);

        drop(relays);
        let mut rest = Vec::new();
        let mut child_in = child_in_r;
        child_in.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }
}
