//! Target audio bitrates

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported output bitrates in kbit/s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum AudioQuality {
    Kbps64,
    Kbps128,
    Kbps192,
    Kbps320,
}

impl AudioQuality {
    pub const ALL: [AudioQuality; 4] = [
        AudioQuality::Kbps64,
        AudioQuality::Kbps128,
        AudioQuality::Kbps192,
        AudioQuality::Kbps320,
    ];

    pub fn kbps(self) -> u32 {
        match self {
            AudioQuality::Kbps64 => 64,
            AudioQuality::Kbps128 => 128,
            AudioQuality::Kbps192 => 192,
            AudioQuality::Kbps320 => 320,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unsupported audio quality {0} kbit/s (expected 64, 128, 192 or 320)")]
pub struct UnsupportedQuality(pub u32);

impl TryFrom<u32> for AudioQuality {
    type Error = UnsupportedQuality;

    fn try_from(kbps: u32) -> Result<Self, Self::Error> {
        AudioQuality::ALL
            .into_iter()
            .find(|q| q.kbps() == kbps)
            .ok_or(UnsupportedQuality(kbps))
    }
}

impl From<AudioQuality> for u32 {
    fn from(quality: AudioQuality) -> Self {
        quality.kbps()
    }
}

impl fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kbps())
    }
}
