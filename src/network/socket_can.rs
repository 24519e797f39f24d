// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Linux SocketCAN transport.
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use log::{debug, warn};
use socketcan::frame::FdFlags;
use socketcan::{EmbeddedFrame, Frame, Socket};

use crate::network::{check_mode, BusError, BusMode, CanFrame, CanTransport};

enum InnerSocket {
    Can(socketcan::CanSocket),
    CanFd(socketcan::CanFdSocket),
}

/// A raw SocketCAN socket bound to one interface.
///
/// The socket is non-blocking. [`receive`](`CanTransport::receive`) reads queued frames first
/// and only then waits with `ppoll`, so a zero timeout returns what is already queued.
pub struct SocketCanTransport {
    socket: InnerSocket,
    interface: String,
    mode: BusMode,
}

impl SocketCanTransport {
    /// Opens `interface`, e.g. "can0", in the given mode.
    ///
    /// # Errors
    /// * [`BusDown`](`BusError::BusDown`) if the interface does not exist or does not support
    /// the mode.
    pub fn open(interface: &str, mode: BusMode) -> Result<SocketCanTransport, BusError> {
        let socket = match mode {
            BusMode::Classic => {
                InnerSocket::Can(socketcan::CanSocket::open(interface).map_err(|e| {
                    BusError::BusDown {
                        message: format!("cannot open {}: {}", interface, e),
                    }
                })?)
            }
            BusMode::Fd => {
                InnerSocket::CanFd(socketcan::CanFdSocket::open(interface).map_err(|e| {
                    BusError::BusDown {
                        message: format!("cannot open {} in FD mode: {}", interface, e),
                    }
                })?)
            }
        };
        let nonblocking = match &socket {
            InnerSocket::Can(socket) => socket.set_nonblocking(true),
            InnerSocket::CanFd(socket) => socket.set_nonblocking(true),
        };
        nonblocking.map_err(|e| bus_down(interface, e))?;
        debug!("opened {} ({:?})", interface, mode);
        Ok(SocketCanTransport {
            socket,
            interface: interface.to_string(),
            mode,
        })
    }

    /// Name of the interface.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn raw_fd(&self) -> RawFd {
        match &self.socket {
            InnerSocket::Can(socket) => socket.as_raw_fd(),
            InnerSocket::CanFd(socket) => socket.as_raw_fd(),
        }
    }

    /// Reads one frame. `Ok(None)` for remote and error frames.
    fn read_data_frame(&self) -> io::Result<Option<CanFrame>> {
        let frame = match &self.socket {
            InnerSocket::Can(socket) => match socket.read_frame()? {
                socketcan::CanFrame::Data(frame) => CanFrame::new(frame.raw_id(), frame.data()),
                socketcan::CanFrame::Remote(_) | socketcan::CanFrame::Error(_) => return Ok(None),
            },
            InnerSocket::CanFd(socket) => match socket.read_frame()? {
                socketcan::CanAnyFrame::Normal(frame) => CanFrame::new(frame.raw_id(), frame.data()),
                socketcan::CanAnyFrame::Fd(frame) => CanFrame::new_fd(frame.raw_id(), frame.data()),
                socketcan::CanAnyFrame::Remote(_) | socketcan::CanAnyFrame::Error(_) => {
                    return Ok(None)
                }
            },
        };
        match frame {
            Ok(frame) => Ok(Some(frame)),
            Err(error) => {
                warn!("{}: dropping malformed frame: {}", self.interface, error);
                Ok(None)
            }
        }
    }
}

/// Blocks until `fd` is readable or `timeout` passed. Interrupts count as a wakeup.
fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let mut poll_fd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    let result = unsafe { libc::ppoll(&mut poll_fd, 1, &timeout, std::ptr::null()) };
    if result < 0 {
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
    Ok(())
}

fn socket_id(frame: &CanFrame) -> Result<socketcan::Id, BusError> {
    let invalid = || BusError::InvalidFrame {
        message: format!("invalid identifier {:#x}", frame.id()),
    };
    if frame.is_extended() {
        Ok(socketcan::Id::Extended(
            socketcan::ExtendedId::new(frame.id()).ok_or_else(invalid)?,
        ))
    } else {
        Ok(socketcan::Id::Standard(
            socketcan::StandardId::new(frame.id() as u16).ok_or_else(invalid)?,
        ))
    }
}

fn bus_down(interface: &str, error: io::Error) -> BusError {
    BusError::BusDown {
        message: format!("{}: {}", interface, error),
    }
}

fn write_error(interface: &str, error: io::Error) -> BusError {
    if error.raw_os_error() == Some(libc::ENOBUFS) || error.kind() == io::ErrorKind::WouldBlock {
        BusError::TransmitFailed {
            message: format!("{}: {}", interface, error),
        }
    } else {
        bus_down(interface, error)
    }
}

impl CanTransport for SocketCanTransport {
    fn mode(&self) -> BusMode {
        self.mode
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        check_mode(frame, self.mode)?;
        let id = socket_id(frame)?;
        let result = match &self.socket {
            InnerSocket::Can(socket) => {
                let data_frame =
                    socketcan::CanDataFrame::new(id, frame.data()).ok_or_else(|| {
                        BusError::InvalidFrame {
                            message: format!("cannot build frame {:#x}", frame.id()),
                        }
                    })?;
                socket.write_frame(&socketcan::CanFrame::Data(data_frame))
            }
            InnerSocket::CanFd(socket) => {
                let fd_frame = socketcan::CanFdFrame::with_flags(id, frame.data(), FdFlags::BRS)
                    .ok_or_else(|| BusError::InvalidFrame {
                        message: format!("cannot build FD frame {:#x}", frame.id()),
                    })?;
                socket.write_frame(&fd_frame)
            }
        };
        result.map_err(|e| write_error(&self.interface, e))
    }

    fn receive(&mut self, timeout: Duration) -> Result<CanFrame, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.read_data_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(BusError::Timeout);
                    }
                    wait_readable(self.raw_fd(), remaining)
                        .map_err(|e| bus_down(&self.interface, e))?;
                }
                Err(e) => return Err(bus_down(&self.interface, e)),
            }
        }
    }
}
