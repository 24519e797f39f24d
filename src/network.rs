// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the CAN transport abstraction the control loop talks through.
//!
//! A transport operates either in classic mode (payloads of up to 8 bytes) or in FD mode
//! (payloads of up to 64 bytes). The mode is chosen when the transport is opened and every frame
//! of a session has to use it. The payload layout of the drives is documented in
//! [`robot::types`](`crate::robot::types`).
use std::fmt::Debug;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use thiserror::Error;

#[cfg(feature = "socketcan")]
pub mod socket_can;
pub mod virtual_bus;

/// Maximum payload of a classic CAN frame.
pub const CLASSIC_MAX_PAYLOAD: usize = 8;
/// Maximum payload of a CAN FD frame.
pub const FD_MAX_PAYLOAD: usize = 64;
/// Payload lengths a CAN FD frame can carry.
const FD_VALID_LENGTHS: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];
/// Largest 29 bit identifier.
const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
/// Largest 11 bit identifier.
const MAX_STANDARD_ID: u32 = 0x7FF;

/// Errors reported by a [`CanTransport`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    /// No frame arrived before the receive timeout elapsed.
    #[error("receive timed out")]
    Timeout,
    /// The bus or the interface is gone. The control loop treats this as fatal.
    #[error("bus down: {message}")]
    BusDown { message: String },
    /// A single frame could not be transmitted, e.g. because the transmit queue is full.
    #[error("transmission failed: {message}")]
    TransmitFailed { message: String },
    /// The frame does not fit the transport, e.g. an FD frame on a classic bus.
    #[error("invalid frame: {message}")]
    InvalidFrame { message: String },
}

impl BusError {
    /// Whether the error only affects the current frame.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Timeout | BusError::TransmitFailed { .. })
    }
}

/// Frame format of a bus session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusMode {
    /// Classic CAN with up to 8 data bytes.
    Classic,
    /// CAN FD with up to 64 data bytes.
    Fd,
}

impl BusMode {
    /// Selects the mode from the FD flag of the configuration.
    pub fn from_fd_flag(enable_fd: bool) -> BusMode {
        if enable_fd {
            BusMode::Fd
        } else {
            BusMode::Classic
        }
    }

    /// Largest payload a frame can carry in this mode.
    pub fn max_payload(&self) -> usize {
        match self {
            BusMode::Classic => CLASSIC_MAX_PAYLOAD,
            BusMode::Fd => FD_MAX_PAYLOAD,
        }
    }

    /// Creates a frame of this mode.
    pub fn frame(&self, id: u32, data: &[u8]) -> Result<CanFrame, BusError> {
        match self {
            BusMode::Classic => CanFrame::new(id, data),
            BusMode::Fd => CanFrame::new_fd(id, data),
        }
    }
}

/// A data frame on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    data: Vec<u8>,
    fd: bool,
}

impl CanFrame {
    /// Creates a classic CAN frame.
    ///
    /// # Arguments
    /// * `id` - CAN identifier (11-bit for standard, 29-bit for extended)
    /// * `data` - Frame data (up to 8 bytes)
    pub fn new(id: u32, data: &[u8]) -> Result<CanFrame, BusError> {
        check_id(id)?;
        if data.len() > CLASSIC_MAX_PAYLOAD {
            return Err(BusError::InvalidFrame {
                message: format!("{} bytes exceed the classic payload", data.len()),
            });
        }
        Ok(CanFrame {
            id,
            data: data.to_vec(),
            fd: false,
        })
    }

    /// Creates a CAN FD frame.
    ///
    /// # Arguments
    /// * `id` - CAN identifier
    /// * `data` - Frame data, one of the FD payload lengths up to 64 bytes
    pub fn new_fd(id: u32, data: &[u8]) -> Result<CanFrame, BusError> {
        check_id(id)?;
        if !FD_VALID_LENGTHS.contains(&data.len()) {
            return Err(BusError::InvalidFrame {
                message: format!("{} bytes is not a valid FD payload length", data.len()),
            });
        }
        Ok(CanFrame {
            id,
            data: data.to_vec(),
            fd: true,
        })
    }

    /// CAN identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Frame payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether this is an FD frame.
    pub fn is_fd(&self) -> bool {
        self.fd
    }

    /// Whether the identifier needs the 29 bit format.
    pub fn is_extended(&self) -> bool {
        self.id > MAX_STANDARD_ID
    }

    /// Whether the frame can be sent on a bus of the given mode.
    pub fn matches(&self, mode: BusMode) -> bool {
        self.fd == (mode == BusMode::Fd)
    }
}

fn check_id(id: u32) -> Result<(), BusError> {
    if id > MAX_EXTENDED_ID {
        return Err(BusError::InvalidFrame {
            message: format!("identifier {:#x} exceeds 29 bits", id),
        });
    }
    Ok(())
}

/// Fails with InvalidFrame if the frame does not belong to the session's mode.
pub(crate) fn check_mode(frame: &CanFrame, mode: BusMode) -> Result<(), BusError> {
    if !frame.matches(mode) {
        return Err(BusError::InvalidFrame {
            message: format!(
                "frame {:#x} does not match the {:?} session",
                frame.id(),
                mode
            ),
        });
    }
    Ok(())
}

/// A bus handle the control loop owns exclusively.
///
/// Implementations exist for Linux SocketCAN
/// ([`SocketCanTransport`](`crate::network::socket_can::SocketCanTransport`), feature
/// `socketcan`) and for a simulated bus
/// ([`VirtualBus`](`crate::network::virtual_bus::VirtualBus`)).
#[cfg_attr(test, automock)]
pub trait CanTransport: Send {
    /// Frame format of the session.
    fn mode(&self) -> BusMode;

    /// Transmits one frame.
    ///
    /// # Errors
    /// * [`TransmitFailed`](`BusError::TransmitFailed`) if only this frame was lost.
    /// * [`BusDown`](`BusError::BusDown`) if the bus is unusable.
    /// * [`InvalidFrame`](`BusError::InvalidFrame`) if the frame does not match the mode.
    fn send(&mut self, frame: &CanFrame) -> Result<(), BusError>;

    /// Waits up to `timeout` for the next frame. With a zero timeout only an already queued
    /// frame is returned.
    ///
    /// # Errors
    /// * [`Timeout`](`BusError::Timeout`) if nothing arrived in time.
    /// * [`BusDown`](`BusError::BusDown`) if the bus is unusable.
    fn receive(&mut self, timeout: Duration) -> Result<CanFrame, BusError>;
}

#[cfg(test)]
mod tests {
    use crate::network::{check_mode, BusError, BusMode, CanFrame};

    #[test]
    fn classic_frame_limits() {
        assert!(CanFrame::new(0x01, &[0; 8]).is_ok());
        match CanFrame::new(0x01, &[0; 9]) {
            Err(BusError::InvalidFrame { .. }) => {}
            other => panic!("expected invalid frame, got {:?}", other),
        }
        assert!(CanFrame::new(0x2000_0000, &[0; 2]).is_err());
        assert!(CanFrame::new(0x1FFF_FFFF, &[0; 2]).unwrap().is_extended());
        assert!(!CanFrame::new(0x7FF, &[]).unwrap().is_extended());
    }

    #[test]
    fn fd_frame_lengths() {
        assert!(CanFrame::new_fd(0x11, &[0; 64]).is_ok());
        assert!(CanFrame::new_fd(0x11, &[0; 12]).is_ok());
        assert!(CanFrame::new_fd(0x11, &[0; 9]).is_err());
        assert!(CanFrame::new_fd(0x11, &[0; 65]).is_err());
    }

    #[test]
    fn mode_consistency() {
        let classic = BusMode::Classic.frame(0x01, &[1, 2, 3]).unwrap();
        let fd = BusMode::Fd.frame(0x01, &[1, 2, 3]).unwrap();
        assert!(classic.matches(BusMode::Classic));
        assert!(!classic.matches(BusMode::Fd));
        assert!(fd.is_fd());
        assert!(check_mode(&fd, BusMode::Classic).is_err());
        assert!(check_mode(&fd, BusMode::Fd).is_ok());
        assert_eq!(BusMode::from_fd_flag(true).max_payload(), 64);
        assert_eq!(BusMode::from_fd_flag(false).max_payload(), 8);
    }

    #[test]
    fn transient_errors() {
        assert!(BusError::Timeout.is_transient());
        assert!(BusError::TransmitFailed {
            message: String::new()
        }
        .is_transient());
        assert!(!BusError::BusDown {
            message: String::new()
        }
        .is_transient());
    }
}
