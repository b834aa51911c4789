//! Deferred state transitions applied by the render thread in post-render.

use crate::arena::BufferId;
use crate::audio_data::AudioBuffer;
use crate::error::{PetalSonicError, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::Arc;

/// A request that is unsafe to apply while the voice may be mid-render.
#[derive(Debug, Clone)]
pub enum DeferredCommand {
    Stop,
    Pause,
    Rewind,
    Play,
    /// Replace the whole queue; `None` only empties it.
    SetBuffer(Option<(BufferId, Arc<AudioBuffer>)>),
    RemoveBuffers(usize),
    SetFramePosition(usize),
    TeardownForDeletion,
}

/// Multi-producer, single-consumer FIFO of [`DeferredCommand`]s.
///
/// Capacity is fixed up front so the render side never allocates; control
/// threads get a [`PetalSonicError::Resource`] when it is full.
pub struct DeferredCommandChannel {
    sender: Sender<DeferredCommand>,
    receiver: Receiver<DeferredCommand>,
}

impl DeferredCommandChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self { sender, receiver }
    }

    pub fn push(&self, command: DeferredCommand) -> Result<()> {
        self.sender.try_send(command).map_err(|e| match e {
            TrySendError::Full(command) => PetalSonicError::Resource(format!(
                "Deferred command queue is full, dropping {:?}",
                command
            )),
            TrySendError::Disconnected(_) => {
                PetalSonicError::Engine("Deferred command queue is closed".into())
            }
        })
    }

    /// Next command in push order, without blocking.
    pub fn pop(&self) -> Option<DeferredCommand> {
        self.receiver.try_recv().ok()
    }

    /// Discards everything still queued.
    pub fn clear(&self) {
        while self.receiver.try_recv().is_ok() {}
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let channel = DeferredCommandChannel::new(8);
        channel.push(DeferredCommand::Pause).unwrap();
        channel.push(DeferredCommand::SetFramePosition(42)).unwrap();
        channel.push(DeferredCommand::Stop).unwrap();

        assert!(matches!(channel.pop(), Some(DeferredCommand::Pause)));
        assert!(matches!(
            channel.pop(),
            Some(DeferredCommand::SetFramePosition(42))
        ));
        assert!(matches!(channel.pop(), Some(DeferredCommand::Stop)));
        assert!(channel.pop().is_none());
    }

    #[test]
    fn test_full_channel_is_resource_error() {
        let channel = DeferredCommandChannel::new(1);
        channel.push(DeferredCommand::Play).unwrap();
        assert!(matches!(
            channel.push(DeferredCommand::Stop),
            Err(PetalSonicError::Resource(_))
        ));
        assert_eq!(channel.len(), 1);
    }

    #[test]
    fn test_many_producers_keep_per_thread_order() {
        let channel = Arc::new(DeferredCommandChannel::new(256));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let channel = Arc::clone(&channel);
                std::thread::spawn(move || {
                    for i in 0..32 {
                        channel
                            .push(DeferredCommand::SetFramePosition(t * 1000 + i))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut last = [None::<usize>; 4];
        let mut count = 0;
        while let Some(DeferredCommand::SetFramePosition(value)) = channel.pop() {
            let thread = value / 1000;
            if let Some(previous) = last[thread] {
                assert!(value > previous);
            }
            last[thread] = Some(value);
            count += 1;
        }
        assert_eq!(count, 128);
    }

    #[test]
    fn test_clear() {
        let channel = DeferredCommandChannel::new(4);
        channel.push(DeferredCommand::Rewind).unwrap();
        channel.push(DeferredCommand::RemoveBuffers(2)).unwrap();
        channel.clear();
        assert!(channel.is_empty());
    }
}
