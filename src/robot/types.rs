// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Wire format of the drives ("MIT mode").
//!
//! A command frame is sent to the drive's motor id and packs five values into 8 bytes:
//!
//! | byte | content                          |
//! |------|----------------------------------|
//! | 0-1  | position, 16 bit                 |
//! | 2-3  | velocity, 12 bit, kp upper 4 bit |
//! | 4    | kp lower 8 bit                   |
//! | 5-6  | kd, 12 bit, torque upper 4 bit   |
//! | 7    | torque lower 8 bit               |
//!
//! Each drive answers with a feedback frame on `motor id + feedback offset`:
//!
//! | byte | content                              |
//! |------|--------------------------------------|
//! | 0    | state nibble << 4, motor id nibble   |
//! | 1-2  | position, 16 bit                     |
//! | 3-4  | velocity 12 bit, torque upper 4 bit  |
//! | 5    | torque lower 8 bit                   |
//! | 6    | MOS temperature \[°C\]               |
//! | 7    | rotor temperature \[°C\]             |
//!
//! All values are mapped linearly from their range onto the unsigned integer of the given width.
use num_traits::FromPrimitive;

use crate::robot::error::DriveState;

/// Position range of the drives in \[rad\].
pub const P_MAX: f64 = 12.5;
/// Velocity range of the drives in \[rad/s\].
pub const V_MAX: f64 = 45.;
/// Upper bound of the stiffness gain.
pub const KP_MAX: f64 = 500.;
/// Upper bound of the damping gain.
pub const KD_MAX: f64 = 5.;
/// Torque range of the drives in \[Nm\].
pub const T_MAX: f64 = 18.;

/// Length of a command or feedback payload.
pub const PAYLOAD_LEN: usize = 8;

/// Payload which enables a drive.
pub const ENABLE_PAYLOAD: [u8; 8] = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFC];
/// Payload which disables a drive.
pub const DISABLE_PAYLOAD: [u8; 8] = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFD];
/// Payload which stores the current position as the drive's zero.
pub const SET_ZERO_PAYLOAD: [u8; 8] = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE];

/// Non-motion commands understood by the drives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpecialCommand {
    Enable,
    Disable,
    SetZero,
}

impl SpecialCommand {
    pub fn payload(&self) -> [u8; 8] {
        match self {
            SpecialCommand::Enable => ENABLE_PAYLOAD,
            SpecialCommand::Disable => DISABLE_PAYLOAD,
            SpecialCommand::SetZero => SET_ZERO_PAYLOAD,
        }
    }

    /// Recognizes a special command in a received payload.
    pub fn parse(data: &[u8]) -> Option<SpecialCommand> {
        if data.len() < PAYLOAD_LEN || data[..7].iter().any(|&b| b != 0xFF) {
            return None;
        }
        match data[7] {
            0xFC => Some(SpecialCommand::Enable),
            0xFD => Some(SpecialCommand::Disable),
            0xFE => Some(SpecialCommand::SetZero),
            _ => None,
        }
    }
}

/// Maps a float in `[min, max]` onto an unsigned integer of `bits` width, saturating outside.
pub fn float_to_uint(x: f64, min: f64, max: f64, bits: u32) -> u32 {
    let levels = ((1u32 << bits) - 1) as f64;
    let x = if x.is_nan() { 0. } else { x.clamp(min, max) };
    ((x - min) / (max - min) * levels).round() as u32
}

/// Inverse of [`float_to_uint`].
pub fn uint_to_float(x: u32, min: f64, max: f64, bits: u32) -> f64 {
    let levels = ((1u32 << bits) - 1) as f64;
    x as f64 * (max - min) / levels + min
}

/// One MIT-mode setpoint for a single drive.
///
/// The drive applies `torque + kp * (position - q) + kd * (velocity - dq)`.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct MotorCommand {
    pub position: f64,
    pub velocity: f64,
    pub kp: f64,
    pub kd: f64,
    pub torque: f64,
}

impl MotorCommand {
    /// A command without stiffness and damping. The drive stays limp and reports its state.
    pub fn query(position: f64) -> MotorCommand {
        MotorCommand {
            position,
            ..MotorCommand::default()
        }
    }

    pub fn encode(&self) -> [u8; 8] {
        let p = float_to_uint(self.position, -P_MAX, P_MAX, 16);
        let v = float_to_uint(self.velocity, -V_MAX, V_MAX, 12);
        let kp = float_to_uint(self.kp, 0., KP_MAX, 12);
        let kd = float_to_uint(self.kd, 0., KD_MAX, 12);
        let t = float_to_uint(self.torque, -T_MAX, T_MAX, 12);
        [
            (p >> 8) as u8,
            (p & 0xFF) as u8,
            (v >> 4) as u8,
            (((v & 0xF) << 4) | (kp >> 8)) as u8,
            (kp & 0xFF) as u8,
            (kd >> 4) as u8,
            (((kd & 0xF) << 4) | (t >> 8)) as u8,
            (t & 0xFF) as u8,
        ]
    }

    /// Decodes a command payload. Returns `None` for short payloads and special commands.
    pub fn decode(data: &[u8]) -> Option<MotorCommand> {
        if data.len() < PAYLOAD_LEN || SpecialCommand::parse(data).is_some() {
            return None;
        }
        let d = |i: usize| data[i] as u32;
        let p = (d(0) << 8) | d(1);
        let v = (d(2) << 4) | (d(3) >> 4);
        let kp = ((d(3) & 0xF) << 8) | d(4);
        let kd = (d(5) << 4) | (d(6) >> 4);
        let t = ((d(6) & 0xF) << 8) | d(7);
        Some(MotorCommand {
            position: uint_to_float(p, -P_MAX, P_MAX, 16),
            velocity: uint_to_float(v, -V_MAX, V_MAX, 12),
            kp: uint_to_float(kp, 0., KP_MAX, 12),
            kd: uint_to_float(kd, 0., KD_MAX, 12),
            torque: uint_to_float(t, -T_MAX, T_MAX, 12),
        })
    }
}

/// State reported by a drive after every command.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MotorFeedback {
    /// Lower nibble of the drive's motor id.
    pub motor_id: u8,
    /// Raw state nibble, see [`state`](`Self::state`).
    pub state_code: u8,
    pub position: f64,
    pub velocity: f64,
    pub torque: f64,
    pub mos_temperature: u8,
    pub rotor_temperature: u8,
}

impl MotorFeedback {
    /// Decoded drive state. `None` for codes the drives do not document.
    pub fn state(&self) -> Option<DriveState> {
        DriveState::from_u8(self.state_code)
    }

    /// Whether the drive reports a fault. Undocumented codes count as faults.
    pub fn is_fault(&self) -> bool {
        self.state().map_or(true, |state| state.is_fault())
    }

    pub fn encode(&self) -> [u8; 8] {
        let p = float_to_uint(self.position, -P_MAX, P_MAX, 16);
        let v = float_to_uint(self.velocity, -V_MAX, V_MAX, 12);
        let t = float_to_uint(self.torque, -T_MAX, T_MAX, 12);
        [
            (self.state_code << 4) | (self.motor_id & 0xF),
            (p >> 8) as u8,
            (p & 0xFF) as u8,
            (v >> 4) as u8,
            (((v & 0xF) << 4) | (t >> 8)) as u8,
            (t & 0xFF) as u8,
            self.mos_temperature,
            self.rotor_temperature,
        ]
    }

    pub fn decode(data: &[u8]) -> Option<MotorFeedback> {
        if data.len() < PAYLOAD_LEN {
            return None;
        }
        let d = |i: usize| data[i] as u32;
        let p = (d(1) << 8) | d(2);
        let v = (d(3) << 4) | (d(4) >> 4);
        let t = ((d(4) & 0xF) << 8) | d(5);
        Some(MotorFeedback {
            motor_id: data[0] & 0xF,
            state_code: data[0] >> 4,
            position: uint_to_float(p, -P_MAX, P_MAX, 16),
            velocity: uint_to_float(v, -V_MAX, V_MAX, 12),
            torque: uint_to_float(t, -T_MAX, T_MAX, 12),
            mos_temperature: data[6],
            rotor_temperature: data[7],
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::robot::error::DriveState;
    use crate::robot::types::{
        float_to_uint, uint_to_float, MotorCommand, MotorFeedback, SpecialCommand, P_MAX,
        T_MAX,
    };

    #[test]
    fn query_command_bytes() {
        // zero position, velocity and torque sit in the middle of their ranges
        assert_eq!(
            MotorCommand::query(0.).encode(),
            [0x80, 0x00, 0x80, 0x00, 0x00, 0x00, 0x08, 0x00]
        );
    }

    #[test]
    fn command_fields_are_packed_in_place() {
        let command = MotorCommand {
            position: P_MAX,
            velocity: -45.,
            kp: 500.,
            kd: 0.,
            torque: T_MAX,
        };
        assert_eq!(
            command.encode(),
            [0xFF, 0xFF, 0x00, 0x0F, 0xFF, 0x00, 0x0F, 0xFF]
        );
    }

    #[test]
    fn command_resolution() {
        let command = MotorCommand {
            position: 1.2345,
            velocity: -3.3,
            kp: 40.,
            kd: 1.5,
            torque: 2.25,
        };
        let decoded = MotorCommand::decode(&command.encode()).unwrap();
        assert!((decoded.position - command.position).abs() < 25. / 65535.);
        assert!((decoded.velocity - command.velocity).abs() < 90. / 4095.);
        assert!((decoded.kp - command.kp).abs() < 500. / 4095.);
        assert!((decoded.kd - command.kd).abs() < 5. / 4095.);
        assert!((decoded.torque - command.torque).abs() < 36. / 4095.);
    }

    #[test]
    fn saturation() {
        assert_eq!(float_to_uint(100., -P_MAX, P_MAX, 16), 0xFFFF);
        assert_eq!(float_to_uint(-100., -P_MAX, P_MAX, 16), 0);
        assert_eq!(uint_to_float(0xFFF, -T_MAX, T_MAX, 12), T_MAX);
    }

    #[test]
    fn feedback_frame() {
        // drive 3, enabled, position 0, velocity 0, torque 0, 30 and 35 degrees
        let data = [0x13, 0x80, 0x00, 0x80, 0x08, 0x00, 30, 35];
        let feedback = MotorFeedback::decode(&data).unwrap();
        assert_eq!(feedback.motor_id, 3);
        assert_eq!(feedback.state(), Some(DriveState::Enabled));
        assert!(!feedback.is_fault());
        assert!(feedback.position.abs() < 1e-3);
        assert!(feedback.velocity.abs() < 0.02);
        assert!(feedback.torque.abs() < 0.01);
        assert_eq!(feedback.mos_temperature, 30);
        assert_eq!(feedback.rotor_temperature, 35);
        assert_eq!(feedback.encode(), data);

        let faulted = MotorFeedback {
            state_code: 0xA,
            ..feedback
        };
        assert_eq!(faulted.state(), Some(DriveState::OverCurrent));
        assert!(faulted.is_fault());
        assert!(MotorFeedback { state_code: 0x5, ..feedback }.is_fault());
        assert!(MotorFeedback::decode(&data[..7]).is_none());
    }

    #[test]
    fn special_commands() {
        for command in [
            SpecialCommand::Enable,
            SpecialCommand::Disable,
            SpecialCommand::SetZero,
        ] {
            assert_eq!(SpecialCommand::parse(&command.payload()), Some(command));
            assert!(MotorCommand::decode(&command.payload()).is_none());
        }
        assert_eq!(SpecialCommand::parse(&[0xFF; 8]), None);
    }
}
