use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer};

use crate::error::Error;

bitflags! {
    /// Controller operating mode, passed to [`Driver::configure`](crate::driver::Driver::configure).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OperatingMode: u8 {
        /// Reception of 11-bit id messages
        const STANDARD = 0x01;
        /// Reception of 29-bit id messages
        const EXTENDED = 0x02;
        /// Reception of error frames
        const ERR_FRAME = 0x04;
        /// Listen only (TX passive)
        const LISTEN_ONLY = 0x08;
        /// Low speed bus interface
        const LOW_SPEED = 0x10;
    }
}

impl Default for OperatingMode {
    fn default() -> Self {
        OperatingMode::STANDARD
    }
}

/// Token table for the string form. Tokens are matched as substrings, so
/// "listenonly" and "listonly" both hit "list" and "lowspeed" hits "low".
const TOKENS: &[(&str, OperatingMode)] = &[
    ("11bit", OperatingMode::STANDARD),
    ("standard", OperatingMode::STANDARD),
    ("base", OperatingMode::STANDARD),
    ("29bit", OperatingMode::EXTENDED),
    ("extended", OperatingMode::EXTENDED),
    ("err", OperatingMode::ERR_FRAME),
    ("list", OperatingMode::LISTEN_ONLY),
    ("low", OperatingMode::LOW_SPEED),
];

impl FromStr for OperatingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if lower.is_empty() {
            return Ok(OperatingMode::default());
        }

        let mode = TOKENS
            .iter()
            .filter(|(token, _)| lower.contains(token))
            .fold(OperatingMode::empty(), |acc, (_, flag)| acc | *flag);

        if mode.is_empty() {
            Err(Error::InvalidMode(s.to_owned()))
        } else {
            Ok(mode)
        }
    }
}

impl<'de> Deserialize<'de> for OperatingMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_standard() {
        assert_eq!("".parse::<OperatingMode>().unwrap(), OperatingMode::STANDARD);
        assert_eq!("  ".parse::<OperatingMode>().unwrap(), OperatingMode::STANDARD);
    }

    #[test]
    fn aliases() {
        for s in ["11bit", "standard", "base"] {
            assert_eq!(s.parse::<OperatingMode>().unwrap(), OperatingMode::STANDARD);
        }
        for s in ["29bit", "extended"] {
            assert_eq!(s.parse::<OperatingMode>().unwrap(), OperatingMode::EXTENDED);
        }
        for s in ["listen", "listenonly", "listonly"] {
            assert_eq!(s.parse::<OperatingMode>().unwrap(), OperatingMode::LISTEN_ONLY);
        }
        for s in ["low", "lowspeed"] {
            assert_eq!(s.parse::<OperatingMode>().unwrap(), OperatingMode::LOW_SPEED);
        }
        assert_eq!("errframe".parse::<OperatingMode>().unwrap(), OperatingMode::ERR_FRAME);
    }

    #[test]
    fn combined() {
        let mode: OperatingMode = "11bit 29bit err listen".parse().unwrap();
        assert_eq!(
            mode,
            OperatingMode::STANDARD
                | OperatingMode::EXTENDED
                | OperatingMode::ERR_FRAME
                | OperatingMode::LISTEN_ONLY
        );
        assert_eq!(mode.bits(), 0x0f);
    }

    #[test]
    fn unknown_is_rejected() {
        assert_eq!(
            "fast".parse::<OperatingMode>(),
            Err(Error::InvalidMode("fast".to_owned()))
        );
    }
}
