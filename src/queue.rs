//! Voice buffer queue split into an active and an inactive half.
//!
//! The active half holds what is left to play, the inactive half what has
//! been played (or skipped). Restarting a loop swaps the halves' roles instead
//! of moving entries. Entries that have not been physically removed yet but
//! were already reported to a caller as unqueued are tracked by
//! `queued_for_clear`.

use crate::arena::{BufferId, ConverterToken};
use crate::audio_data::AudioBuffer;
use crate::error::{PetalSonicError, Result};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedState {
    Pending,
    InProgress,
    Processed,
}

/// One queued buffer.
#[derive(Debug, Clone)]
pub struct BufferInfo {
    pub buffer_id: BufferId,
    pub buffer: Arc<AudioBuffer>,
    /// Read position in bytes, always a whole number of frames.
    pub offset: usize,
    pub processed: ProcessedState,
    pub converter: Option<ConverterToken>,
}

impl BufferInfo {
    pub fn new(
        buffer_id: BufferId,
        buffer: Arc<AudioBuffer>,
        converter: Option<ConverterToken>,
    ) -> Self {
        Self {
            buffer_id,
            buffer,
            offset: 0,
            processed: ProcessedState::Pending,
            converter,
        }
    }

    pub fn current_frame(&self) -> usize {
        self.offset / self.buffer.format().bytes_per_frame()
    }

    pub fn frames_left(&self) -> usize {
        self.buffer.total_frames().saturating_sub(self.current_frame())
    }

    /// Empty entries carry no audio and are skipped by the renderer.
    pub fn is_playable(&self) -> bool {
        !self.buffer.is_empty()
    }
}

/// One ordered half of a [`BufferQueue`].
#[derive(Debug, Default)]
pub struct BufferList {
    entries: VecDeque<BufferInfo>,
}

impl BufferList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BufferInfo> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut BufferInfo> {
        self.entries.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferInfo> {
        self.entries.iter()
    }

    pub fn append_buffer(&mut self, info: BufferInfo) {
        self.entries.push_back(info);
    }

    /// Detaches entry `index` without releasing it, for moving to the other half.
    pub fn take_entry(&mut self, index: usize) -> Option<BufferInfo> {
        self.entries.remove(index)
    }

    /// Removes entry `index` and drops its attachment to the buffer.
    pub fn release_entry(&mut self, index: usize) -> Option<BufferId> {
        self.entries.remove(index).map(|info| info.buffer_id)
    }

    pub fn queue_size_in_frames(&self) -> usize {
        self.entries.iter().map(|e| e.buffer.total_frames()).sum()
    }

    pub fn buffer_frame_count(&self, index: usize) -> usize {
        self.get(index).map_or(0, |e| e.buffer.total_frames())
    }

    pub fn current_frame(&self, index: usize) -> usize {
        self.get(index).map_or(0, BufferInfo::current_frame)
    }

    pub fn buffer_id_by_index(&self, index: usize) -> Option<BufferId> {
        self.get(index).map(|e| e.buffer_id)
    }

    /// Seeks into the first entry.
    pub fn set_first_buffer_offset(&mut self, frame_offset: usize) {
        if let Some(first) = self.entries.front_mut() {
            first.offset = frame_offset * first.buffer.format().bytes_per_frame();
        }
    }

    pub fn set_processed(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.processed = ProcessedState::Processed;
        }
    }

    /// Marks everything unplayed and rewinds every entry.
    pub fn reset_buffers(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.processed = ProcessedState::Pending;
            entry.offset = 0;
        }
    }

    fn reserve_total(&mut self, total: usize) {
        let capacity = self.entries.capacity();
        if capacity < total {
            self.entries.reserve(total - self.entries.len());
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The active/inactive pair plus the read cursor into the active half.
#[derive(Debug, Default)]
pub struct BufferQueue {
    halves: [BufferList; 2],
    active: usize,
    current_index: usize,
    drained: bool,
    queued_for_clear: usize,
}

impl BufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> &BufferList {
        &self.halves[self.active]
    }

    pub fn active_mut(&mut self) -> &mut BufferList {
        &mut self.halves[self.active]
    }

    pub fn inactive(&self) -> &BufferList {
        &self.halves[self.active ^ 1]
    }

    pub fn inactive_mut(&mut self) -> &mut BufferList {
        &mut self.halves[self.active ^ 1]
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn set_current_index(&mut self, index: usize) {
        self.current_index = index;
    }

    /// Whether the renderer ran out of data.
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    pub fn set_drained(&mut self, drained: bool) {
        self.drained = drained;
    }

    pub fn queued_for_clear(&self) -> usize {
        self.queued_for_clear
    }

    pub fn add_queued_for_clear(&mut self, count: usize) {
        self.queued_for_clear += count;
    }

    /// Externally visible length, excluding entries already reported as removed.
    pub fn len(&self) -> usize {
        (self.active().len() + self.inactive().len()).saturating_sub(self.queued_for_clear)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries physically present in both halves.
    pub fn physical_len(&self) -> usize {
        self.active().len() + self.inactive().len()
    }

    /// Entry at the read cursor.
    pub fn current(&self) -> Option<&BufferInfo> {
        self.active().get(self.current_index)
    }

    pub fn current_mut(&mut self) -> Option<&mut BufferInfo> {
        let index = self.current_index;
        self.active_mut().get_mut(index)
    }

    /// Appends to the active half, reserving room in both halves so later
    /// moves between them never reallocate.
    pub fn append_buffer(&mut self, info: BufferInfo) {
        let total = self.physical_len() + 1;
        for half in self.halves.iter_mut() {
            half.reserve_total(total);
        }
        self.active_mut().append_buffer(info);
    }

    pub fn swap_halves(&mut self) {
        self.active ^= 1;
    }

    fn move_active_front_to_inactive(&mut self) {
        if let Some(mut entry) = self.active_mut().take_entry(0) {
            entry.processed = ProcessedState::Processed;
            self.inactive_mut().append_buffer(entry);
        }
    }

    /// Moves every active entry, in order, to the end of the inactive half.
    pub fn clear_active_queue(&mut self) {
        while !self.active().is_empty() {
            self.move_active_front_to_inactive();
        }
    }

    /// Restarts a looping queue from its first entry.
    pub fn loop_to_beginning(&mut self) {
        self.clear_active_queue();
        self.swap_halves();
        self.active_mut().reset_buffers();
        self.current_index = 0;
        self.drained = false;
    }

    /// Rejoins both halves into a fresh active half, in original order.
    pub fn join_buffer_lists(&mut self) {
        self.update_queue();
        self.clear_active_queue();
        self.swap_halves();
        self.active_mut().reset_buffers();
        self.current_index = 0;
        self.drained = false;
    }

    /// Retires entries before the cursor to the inactive half.
    pub fn update_queue(&mut self) {
        for _ in 0..self.current_index {
            self.move_active_front_to_inactive();
        }
        self.current_index = 0;
    }

    /// Advances the cursor past empty entries and returns the first playable one.
    pub fn next_playable_in_active(&mut self) -> Option<usize> {
        loop {
            let index = self.current_index;
            let entry = self.active_mut().get_mut(index)?;
            if entry.is_playable() {
                return Some(index);
            }
            entry.processed = ProcessedState::Processed;
            self.current_index += 1;
        }
    }

    /// Positions the queue at `frame` counted from the start of the active half.
    /// Whole buffers before it are retired as processed.
    ///
    /// # Errors
    ///
    /// [`PetalSonicError::InvalidValue`] when `frame` lies past the end of the queue.
    pub fn advance_to_frame_index(&mut self, frame: usize) -> Result<()> {
        let total = self.active().queue_size_in_frames();
        if frame > total {
            return Err(PetalSonicError::InvalidValue(format!(
                "Offset {} frames is beyond the queue length of {} frames",
                frame, total
            )));
        }

        let mut start_of_current = 0;
        while let Some(first) = self.active().get(0) {
            let count = first.buffer.total_frames();
            if start_of_current + count > frame {
                self.active_mut().set_first_buffer_offset(frame - start_of_current);
                break;
            }
            self.move_active_front_to_inactive();
            start_of_current += count;
        }
        self.current_index = 0;
        Ok(())
    }

    /// Playback position in frames from the start of the queue.
    pub fn offset_in_frames(&self) -> usize {
        let played = self.inactive().queue_size_in_frames();
        let active = self.active();
        let before_cursor: usize = (0..self.current_index)
            .map(|i| active.buffer_frame_count(i))
            .sum();
        played + before_cursor + active.current_frame(self.current_index)
    }

    /// Releases every entry in both halves.
    pub fn flush(&mut self) {
        for half in self.halves.iter_mut() {
            half.clear();
        }
        self.current_index = 0;
        self.queued_for_clear = 0;
        self.drained = false;
    }

    /// Releases `count` entries from the front of the inactive half.
    pub fn release_from_inactive(&mut self, count: usize) -> Vec<BufferId> {
        let mut released = Vec::with_capacity(count);
        for _ in 0..count {
            match self.inactive_mut().release_entry(0) {
                Some(id) => released.push(id),
                None => break,
            }
        }
        self.queued_for_clear = self.queued_for_clear.saturating_sub(released.len());
        released
    }

    /// Same as [`release_from_inactive`](Self::release_from_inactive) without
    /// collecting ids. Returns how many entries went.
    pub fn discard_from_inactive(&mut self, count: usize) -> usize {
        let mut discarded = 0;
        while discarded < count && self.inactive_mut().release_entry(0).is_some() {
            discarded += 1;
        }
        self.queued_for_clear = self.queued_for_clear.saturating_sub(discarded);
        discarded
    }

    /// Iterates the whole queue in play order: inactive first, then active.
    pub fn iter(&self) -> impl Iterator<Item = &BufferInfo> {
        self.inactive().iter().chain(self.active().iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::{AudioBuffer, AudioFormat, BufferRegistry, SampleData};

    fn make_queue(frames: &[usize]) -> (BufferRegistry, BufferQueue, Vec<BufferId>) {
        let mut registry = BufferRegistry::new();
        let mut queue = BufferQueue::new();
        let mut ids = Vec::new();
        for &count in frames {
            let buffer = AudioBuffer::new(
                AudioFormat::mono_f32(1000),
                SampleData::F32(vec![0.0; count]),
            )
            .unwrap();
            let id = registry.insert(buffer);
            let data = registry.get(id).cloned().unwrap();
            queue.append_buffer(BufferInfo::new(id, data, None));
            ids.push(id);
        }
        (registry, queue, ids)
    }

    fn order(queue: &BufferQueue) -> Vec<BufferId> {
        queue.iter().map(|e| e.buffer_id).collect()
    }

    #[test]
    fn test_append_and_sizes() {
        let (_registry, queue, ids) = make_queue(&[10, 20, 30]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.active().queue_size_in_frames(), 60);
        assert_eq!(queue.active().buffer_frame_count(1), 20);
        assert_eq!(order(&queue), ids);
    }

    #[test]
    fn test_update_and_loop_preserve_order() {
        let (_registry, mut queue, ids) = make_queue(&[10, 10, 10]);
        queue.set_current_index(2);
        queue.update_queue();
        assert_eq!(queue.inactive().len(), 2);
        assert_eq!(queue.active().len(), 1);
        assert_eq!(order(&queue), ids);

        queue.loop_to_beginning();
        assert_eq!(queue.active().len(), 3);
        assert!(queue.inactive().is_empty());
        assert_eq!(queue.active().buffer_id_by_index(0), Some(ids[0]));
        assert!(queue.active().iter().all(|e| e.processed == ProcessedState::Pending));
    }

    #[test]
    fn test_join_buffer_lists_mid_queue() {
        let (_registry, mut queue, ids) = make_queue(&[10, 10, 10]);
        queue.set_current_index(1);
        queue.update_queue();
        queue.active_mut().get_mut(0).unwrap().offset = 8;

        queue.join_buffer_lists();
        assert_eq!(queue.current_index(), 0);
        let active: Vec<_> = queue.active().iter().map(|e| e.buffer_id).collect();
        assert_eq!(active, ids);
        assert!(queue.active().iter().all(|e| e.offset == 0));
    }

    #[test]
    fn test_advance_to_frame_index() {
        let (_registry, mut queue, ids) = make_queue(&[10, 20, 30]);
        queue.advance_to_frame_index(25).unwrap();
        assert_eq!(queue.inactive().len(), 1);
        assert_eq!(queue.current().map(|e| e.buffer_id), Some(ids[1]));
        assert_eq!(queue.current().map(BufferInfo::current_frame), Some(15));
        assert_eq!(queue.offset_in_frames(), 25);
    }

    #[test]
    fn test_advance_past_end_is_invalid_value() {
        let (_registry, mut queue, _) = make_queue(&[10]);
        assert!(matches!(
            queue.advance_to_frame_index(11),
            Err(PetalSonicError::InvalidValue(_))
        ));
        assert!(queue.advance_to_frame_index(10).is_ok());
        assert!(queue.active().is_empty());
    }

    #[test]
    fn test_next_playable_skips_empty_entries() {
        let (_registry, mut queue, _) = make_queue(&[0, 0, 5]);
        assert_eq!(queue.next_playable_in_active(), Some(2));
        assert_eq!(queue.active().get(0).unwrap().processed, ProcessedState::Processed);

        let (_registry, mut empty, _) = make_queue(&[0]);
        assert_eq!(empty.next_playable_in_active(), None);
    }

    #[test]
    fn test_release_drops_attachments() {
        let (registry, mut queue, ids) = make_queue(&[4, 4]);
        assert_eq!(registry.attachment_count(ids[0]), Some(1));
        queue.clear_active_queue();
        let released = queue.release_from_inactive(1);
        assert_eq!(released, vec![ids[0]]);
        assert_eq!(registry.attachment_count(ids[0]), Some(0));
        assert_eq!(registry.attachment_count(ids[1]), Some(1));

        queue.flush();
        assert_eq!(registry.attachment_count(ids[1]), Some(0));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queued_for_clear_hides_entries() {
        let (_registry, mut queue, ids) = make_queue(&[4, 4, 4]);
        queue.add_queued_for_clear(2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.physical_len(), 3);

        queue.clear_active_queue();
        assert_eq!(queue.discard_from_inactive(2), 2);
        assert_eq!(queue.queued_for_clear(), 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(order(&queue), vec![ids[2]]);
    }
}
