//! Enable/disable profiles of the streaming peripherals.
//!
//! The event bus switches a channel's hardware stream on when its first
//! listener registers and off when the last one leaves.  The commands it
//! issues for that come from a [`ChannelProfile`]; [`profiles`] builds the
//! table for every peripheral this crate knows.
//!
//! | Channel | Enable | Disable |
//! |---|---|---|
//! | `hba_qtr.qtr` | `period`, `thresh`, `ctrl f` | `ctrl 0` |
//! | `hba_quad.enc*` | `ctrl 7` | `ctrl 0` |
//! | `hba_basicio.buttons` | `intr 1` | `intr 0` |
//! | `hba_sonar.sonar*` | `ctrl 1` | `ctrl 0` |

use std::collections::HashMap;

use hba_types::{Channel, ChannelProfile, Command, encode_hex};

use crate::actuator::{BASICIO, DriveMode};

pub const QTR: &str = "hba_qtr";
pub const QUAD: &str = "hba_quad";
pub const SONAR: &str = "hba_sonar";

/// Tunables written when the line sensors are armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeripheralSettings {
    /// Sample period; `0` streams on every change.
    pub qtr_period: u8,
    /// Reflectance threshold separating table from edge.
    pub qtr_thresh: u8,
}

impl Default for PeripheralSettings {
    fn default() -> Self {
        Self {
            qtr_period: 0,
            qtr_thresh: 0x1f,
        }
    }
}

fn toggle(peripheral: &str, register: &str, on: &str) -> ChannelProfile {
    ChannelProfile {
        enable: vec![Command::set(peripheral, register, on)],
        disable: vec![Command::set(peripheral, register, "0")],
    }
}

/// Profile of one channel, or `None` for channels that need no arming.
pub fn profile(channel: &Channel, settings: &PeripheralSettings) -> Option<ChannelProfile> {
    let profile = match (channel.peripheral.as_str(), channel.register.as_str()) {
        (QTR, "qtr") => ChannelProfile {
            enable: vec![
                Command::set(QTR, "period", encode_hex(settings.qtr_period.into())),
                Command::set(QTR, "thresh", encode_hex(settings.qtr_thresh.into())),
                Command::set(QTR, "ctrl", "f"),
            ],
            disable: vec![Command::set(QTR, "ctrl", "0")],
        },
        (QUAD, "enc" | "enc0" | "enc1") => toggle(QUAD, "ctrl", "7"),
        (BASICIO, "buttons") => toggle(BASICIO, "intr", "1"),
        (SONAR, "sonar0" | "sonar1") => toggle(SONAR, "ctrl", "1"),
        _ => return None,
    };
    Some(profile)
}

/// Profiles for every known streaming channel.
pub fn profiles(settings: &PeripheralSettings) -> HashMap<Channel, ChannelProfile> {
    [
        (QTR, "qtr"),
        (QUAD, "enc"),
        (QUAD, "enc0"),
        (QUAD, "enc1"),
        (BASICIO, "buttons"),
        (SONAR, "sonar0"),
        (SONAR, "sonar1"),
    ]
    .into_iter()
    .filter_map(|(p, r)| {
        let channel = Channel::new(p, r);
        profile(&channel, settings).map(|profile| (channel, profile))
    })
    .collect()
}

/// Commands issued once before any behavior runs: motors braked.
pub fn init_commands() -> Vec<Command> {
    vec![DriveMode::Brake.command()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(commands: &[Command]) -> Vec<String> {
        commands.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn qtr_profile_writes_settings_then_ctrl() {
        let settings = PeripheralSettings {
            qtr_period: 4,
            qtr_thresh: 0x20,
        };
        let p = profile(&Channel::new("hba_qtr", "qtr"), &settings).unwrap();
        assert_eq!(
            lines(&p.enable),
            vec![
                "hbaset hba_qtr period 4",
                "hbaset hba_qtr thresh 20",
                "hbaset hba_qtr ctrl f",
            ]
        );
        assert_eq!(lines(&p.disable), vec!["hbaset hba_qtr ctrl 0"]);
    }

    #[test]
    fn disable_clears_the_same_register() {
        for (channel, p) in profiles(&PeripheralSettings::default()) {
            let on = p.enable.last().unwrap().channel().clone();
            let off = p.disable[0].channel().clone();
            assert_eq!(on, off, "{channel}");
        }
    }

    #[test]
    fn unknown_channels_have_no_profile() {
        assert!(profile(&Channel::new("hba_motor", "mode"), &PeripheralSettings::default()).is_none());
        assert_eq!(profiles(&PeripheralSettings::default()).len(), 7);
    }

    #[test]
    fn init_brakes_motors() {
        assert_eq!(lines(&init_commands()), vec!["hbaset hba_motor mode bb"]);
    }
}
