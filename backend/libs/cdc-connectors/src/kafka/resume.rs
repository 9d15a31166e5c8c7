use crate::position::BrokerPosition;

/// Offset-based replay suppression for one `stream_changes` call
///
/// While the consumer replays records up to the saved position, events on the
/// saved (topic, partition) at or below the saved offset are suppressed. The
/// first event that breaks that match opens the gate for good: everything
/// after it is emitted without further comparison.
///
/// Best effort only. If the saved offset is no longer retained by the broker,
/// nothing on that partition passes until a newer offset shows up; there is no
/// reconciliation against the partition's low watermark.
#[derive(Debug)]
pub struct ResumeGate {
    saved: Option<BrokerPosition>,
    passed: bool,
}

impl ResumeGate {
    pub fn new(saved: Option<BrokerPosition>) -> Self {
        let passed = saved.is_none();
        Self { saved, passed }
    }

    /// Whether an event at `position` should be emitted
    pub fn admit(&mut self, position: &BrokerPosition) -> bool {
        if self.passed {
            return true;
        }

        let replayed = self
            .saved
            .as_ref()
            .map(|saved| saved.same_partition(position) && position.offset <= saved.offset)
            .unwrap_or(false);

        if !replayed {
            self.passed = true;
        }
        !replayed
    }

    pub fn has_passed(&self) -> bool {
        self.passed
    }

    pub fn saved(&self) -> Option<&BrokerPosition> {
        self.saved.as_ref()
    }
}
