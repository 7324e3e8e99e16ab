//! [`SensorCache`] – the most recent sample of every input the robot reacts
//! to.
//!
//! The cache is owned by whoever drives the actuators (the arbiter or the
//! tablebot) and is only mutated from its dispatch step.  Behaviors read it
//! by reference; they never write to it.

use hba_hal::SensorReading;
use hba_types::Channel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorCache {
    /// Encoder channel whose count is tracked as `last_quad`.
    encoder: Channel,
    pub last_qtr0: Option<u8>,
    pub last_qtr1: Option<u8>,
    pub last_quad: Option<i32>,
    pub last_buttons: Option<u8>,
    pub last_sonar: Option<u32>,
}

impl SensorCache {
    pub fn new(encoder: Channel) -> Self {
        Self {
            encoder,
            last_qtr0: None,
            last_qtr1: None,
            last_quad: None,
            last_buttons: None,
            last_sonar: None,
        }
    }

    pub fn encoder(&self) -> &Channel {
        &self.encoder
    }

    /// Fold one reading received on `channel` into the cache.
    pub fn apply(&mut self, channel: &Channel, reading: &SensorReading) {
        match reading {
            SensorReading::Line { qtr0, qtr1 } => {
                self.last_qtr0 = Some(*qtr0);
                self.last_qtr1 = Some(*qtr1);
            }
            SensorReading::Encoder { count } if *channel == self.encoder => {
                self.last_quad = Some(*count);
            }
            SensorReading::Buttons { mask } => self.last_buttons = Some(*mask),
            SensorReading::Sonar { distance } => self.last_sonar = Some(*distance),
            _ => {}
        }
    }

    /// Latest line sample as a reading, if any arrived yet.
    pub fn line(&self) -> Option<SensorReading> {
        Some(SensorReading::Line {
            qtr0: self.last_qtr0?,
            qtr1: self.last_qtr1?,
        })
    }

    /// True when the latest line sample shows the table edge.
    pub fn at_edge(&self) -> bool {
        self.line().is_some_and(|line| line.is_edge())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc1() -> Channel {
        Channel::new("hba_quad", "enc1")
    }

    #[test]
    fn tracks_only_the_configured_encoder() {
        let mut cache = SensorCache::new(enc1());
        cache.apply(&Channel::new("hba_quad", "enc0"), &SensorReading::Encoder { count: 7 });
        assert_eq!(cache.last_quad, None);
        cache.apply(&enc1(), &SensorReading::Encoder { count: -50 });
        assert_eq!(cache.last_quad, Some(-50));
    }

    #[test]
    fn edge_follows_latest_line_sample() {
        let mut cache = SensorCache::new(enc1());
        let qtr = Channel::new("hba_qtr", "qtr");
        assert!(!cache.at_edge());
        cache.apply(&qtr, &SensorReading::Line { qtr0: 0xff, qtr1: 0 });
        assert!(cache.at_edge());
        cache.apply(&qtr, &SensorReading::Line { qtr0: 0x10, qtr1: 0 });
        assert!(!cache.at_edge());
    }

    #[test]
    fn raw_readings_leave_cache_untouched() {
        let mut cache = SensorCache::new(enc1());
        let before = cache.clone();
        cache.apply(&Channel::new("x", "y"), &SensorReading::Raw { fields: vec![] });
        assert_eq!(cache, before);
    }
}
