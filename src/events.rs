//! Event types for PetalSonic

use crate::arena::VoiceId;
use crossbeam_channel::{Receiver, Sender, TrySendError};

#[derive(Debug, Clone, PartialEq)]
pub enum PetalSonicEvent {
    VoiceStarted {
        voice_id: VoiceId,
    },
    VoicePaused {
        voice_id: VoiceId,
    },
    VoiceStopped {
        voice_id: VoiceId,
    },
    /// The queue ran out of data and the voice stopped by itself.
    VoiceCompleted {
        voice_id: VoiceId,
    },
    VoiceLooped {
        voice_id: VoiceId,
    },
    /// A deferred command could not be applied.
    CommandFailed {
        voice_id: VoiceId,
        error: String,
    },
    /// The device read frames the render thread had not produced yet.
    BufferUnderrun {
        frames: usize,
    },
    EngineStarted,
    EngineStopped,
    EngineError {
        error: String,
    },
}

impl PetalSonicEvent {
    pub fn voice_id(&self) -> Option<VoiceId> {
        match self {
            Self::VoiceStarted { voice_id }
            | Self::VoicePaused { voice_id }
            | Self::VoiceStopped { voice_id }
            | Self::VoiceCompleted { voice_id }
            | Self::VoiceLooped { voice_id }
            | Self::CommandFailed { voice_id, .. } => Some(*voice_id),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::CommandFailed { .. } | Self::BufferUnderrun { .. } | Self::EngineError { .. }
        )
    }
}

/// Non-blocking event publisher usable from the render and device threads.
#[derive(Clone)]
pub struct EventSink {
    sender: Sender<PetalSonicEvent>,
}

impl EventSink {
    pub fn emit(&self, event: PetalSonicEvent) {
        if let Err(TrySendError::Full(event)) = self.sender.try_send(event) {
            log::trace!("Event queue full, dropping {:?}", event);
        }
    }
}

/// Bounded event channel; the oldest undelivered events win when it fills up.
pub(crate) fn event_channel(capacity: usize) -> (EventSink, Receiver<PetalSonicEvent>) {
    let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
    (EventSink { sender }, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    #[test]
    fn test_full_channel_drops_newest() {
        let mut arena: Arena<VoiceId, ()> = Arena::new();
        let id = arena.insert(());
        let (sink, receiver) = event_channel(1);
        sink.emit(PetalSonicEvent::VoiceStarted { voice_id: id });
        sink.emit(PetalSonicEvent::VoiceStopped { voice_id: id });

        assert_eq!(
            receiver.try_recv().ok(),
            Some(PetalSonicEvent::VoiceStarted { voice_id: id })
        );
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_classification() {
        assert!(PetalSonicEvent::BufferUnderrun { frames: 4 }.is_error());
        assert!(!PetalSonicEvent::EngineStarted.is_error());
        assert_eq!(PetalSonicEvent::EngineStopped.voice_id(), None);
    }
}
