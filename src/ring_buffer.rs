//! Time-addressed multi-channel ring buffer.
//!
//! One writer stores blocks at a monotonic sample time; any number of readers
//! fetch windows by sample time from other threads. There is no lock: the valid
//! `[start, end)` window is published through a small ring of versioned slots,
//! and a reader that cannot get a consistent snapshot within a few attempts gets
//! [`RingBufferError::CpuOverload`] rather than spinning.

use crate::error::RingBufferError;
use atomic_float::AtomicF32;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering, fence};

const TIME_BOUNDS_SLOTS: u32 = 32;
const TIME_BOUNDS_MASK: u32 = TIME_BOUNDS_SLOTS - 1;
const SNAPSHOT_ATTEMPTS: usize = 8;
/// Marks a slot whose contents are being rewritten.
const SLOT_WRITING: u32 = u32::MAX;

struct TimeBoundsSlot {
    start: AtomicI64,
    end: AtomicI64,
    update_counter: AtomicU32,
}

impl TimeBoundsSlot {
    fn new() -> Self {
        Self {
            start: AtomicI64::new(0),
            end: AtomicI64::new(0),
            update_counter: AtomicU32::new(0),
        }
    }
}

struct Shared {
    channels: Box<[Box<[AtomicF32]>]>,
    capacity: usize,
    mask: usize,
    slots: Box<[TimeBoundsSlot]>,
    current: AtomicU32,
}

impl Shared {
    fn frame_offset(&self, time: i64) -> usize {
        (time as usize) & self.mask
    }

    /// Reads the published `(start, end)` pair.
    fn time_bounds(&self) -> Result<(i64, i64), RingBufferError> {
        for _ in 0..SNAPSHOT_ATTEMPTS {
            let current = self.current.load(Ordering::Acquire);
            let slot = &self.slots[(current & TIME_BOUNDS_MASK) as usize];
            if slot.update_counter.load(Ordering::Acquire) != current {
                continue;
            }
            let start = slot.start.load(Ordering::Relaxed);
            let end = slot.end.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if slot.update_counter.load(Ordering::Relaxed) == current {
                return Ok((start, end));
            }
        }
        Err(RingBufferError::CpuOverload)
    }

    fn check_time_bounds(&self, start_read: i64, end_read: i64) -> Result<(), RingBufferError> {
        let (start_time, end_time) = self.time_bounds()?;
        classify(start_read, end_read, start_time, end_time)
    }

    fn fetch<B: AsMut<[f32]>>(
        &self,
        out: &mut [B],
        frame_count: usize,
        start_read: i64,
    ) -> Result<(), RingBufferError> {
        let end_read = start_read + frame_count as i64;
        let (start_time, end_time) = match self.time_bounds() {
            Ok(bounds) => bounds,
            Err(err) => {
                zero_outputs(out, 0, frame_count);
                return Err(err);
            }
        };
        let status = classify(start_read, end_read, start_time, end_time);

        let copy_start = start_read.max(start_time);
        let copy_end = end_read.min(end_time);
        self.copy_window(out, frame_count, start_read, copy_start, copy_end);

        // pairs with the fence in `store`: a lapped copy sees the moved start
        fence(Ordering::Acquire);
        let bounds = self.time_bounds();
        revalidate(out, frame_count, start_read, (copy_start, copy_end), status, bounds)
    }

    fn copy_window<B: AsMut<[f32]>>(
        &self,
        out: &mut [B],
        frame_count: usize,
        start_read: i64,
        copy_start: i64,
        copy_end: i64,
    ) {
        if copy_end <= copy_start {
            zero_outputs(out, 0, frame_count);
            return;
        }
        let lead = (copy_start - start_read) as usize;
        let copied = (copy_end - copy_start) as usize;
        zero_outputs(out, 0, lead);
        zero_outputs(out, lead + copied, frame_count);

        for (channel, dest) in self.channels.iter().zip(out.iter_mut()) {
            let dest = dest.as_mut();
            let mut offset = self.frame_offset(copy_start);
            for sample in &mut dest[lead..lead + copied] {
                *sample = channel[offset].load(Ordering::Relaxed);
                offset = (offset + 1) & self.mask;
            }
        }
    }
}

fn classify(
    start_read: i64,
    end_read: i64,
    start_time: i64,
    end_time: i64,
) -> Result<(), RingBufferError> {
    if start_read < start_time {
        if end_read > end_time {
            return Err(RingBufferError::TooMuch);
        }
        if end_read < start_time {
            return Err(RingBufferError::WayBehind);
        }
        return Err(RingBufferError::SlightlyBehind);
    }
    if end_read > end_time {
        if start_read > end_time {
            return Err(RingBufferError::WayAhead);
        }
        return Err(RingBufferError::SlightlyAhead);
    }
    Ok(())
}

/// Settles a fetch once the window has been copied. Frames the writer
/// reclaimed during the copy are zeroed, whatever the first classification said.
fn revalidate<B: AsMut<[f32]>>(
    out: &mut [B],
    frame_count: usize,
    start_read: i64,
    (copy_start, copy_end): (i64, i64),
    status: Result<(), RingBufferError>,
    bounds: Result<(i64, i64), RingBufferError>,
) -> Result<(), RingBufferError> {
    let (new_start, new_end) = match bounds {
        Ok(bounds) => bounds,
        Err(err) => {
            zero_outputs(out, 0, frame_count);
            return Err(err);
        }
    };
    let valid_start = copy_start.max(new_start);
    let valid_end = copy_end.min(new_end);
    if valid_end <= valid_start {
        zero_outputs(out, 0, frame_count);
    } else {
        zero_outputs(out, 0, (valid_start - start_read) as usize);
        zero_outputs(out, (valid_end - start_read) as usize, frame_count);
    }

    let recheck = classify(start_read, start_read + frame_count as i64, new_start, new_end);
    if recheck.is_err() {
        return recheck;
    }
    status
}

fn zero_outputs<B: AsMut<[f32]>>(out: &mut [B], from: usize, to: usize) {
    if from >= to {
        return;
    }
    for dest in out.iter_mut() {
        let dest = dest.as_mut();
        let to = to.min(dest.len());
        if from < to {
            dest[from..to].fill(0.0);
        }
    }
}

/// The writing end of a time-addressed ring buffer.
///
/// Owning the `RingBuffer` is what makes its holder the single writer; readers
/// get a [`RingReader`] through [`RingBuffer::reader`].
pub struct RingBuffer {
    shared: Arc<Shared>,
}

/// Cloneable read-only view of a [`RingBuffer`].
#[derive(Clone)]
pub struct RingReader {
    shared: Arc<Shared>,
}

impl RingBuffer {
    /// Allocates `channels` planes of the next power of two ≥ `capacity_frames` frames.
    pub fn new(channels: usize, capacity_frames: usize) -> Self {
        let capacity = capacity_frames.max(1).next_power_of_two();
        let channels = (0..channels)
            .map(|_| (0..capacity).map(|_| AtomicF32::new(0.0)).collect())
            .collect();
        let slots = (0..TIME_BOUNDS_SLOTS).map(|_| TimeBoundsSlot::new()).collect();

        Self {
            shared: Arc::new(Shared {
                channels,
                capacity,
                mask: capacity - 1,
                slots,
                current: AtomicU32::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn channels(&self) -> usize {
        self.shared.channels.len()
    }

    /// Bytes occupied by one frame of one channel plane.
    pub fn bytes_per_frame(&self) -> usize {
        std::mem::size_of::<f32>()
    }

    pub fn reader(&self) -> RingReader {
        RingReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Currently published `[start, end)` window.
    pub fn time_bounds(&self) -> Result<(i64, i64), RingBufferError> {
        self.shared.time_bounds()
    }

    fn end_time(&self) -> i64 {
        let current = self.shared.current.load(Ordering::Relaxed);
        let slot = &self.shared.slots[(current & TIME_BOUNDS_MASK) as usize];
        slot.end.load(Ordering::Relaxed)
    }

    fn start_time(&self) -> i64 {
        let current = self.shared.current.load(Ordering::Relaxed);
        let slot = &self.shared.slots[(current & TIME_BOUNDS_MASK) as usize];
        slot.start.load(Ordering::Relaxed)
    }

    fn set_time_bounds(&mut self, start: i64, end: i64) {
        let next = self.shared.current.load(Ordering::Relaxed).wrapping_add(1);
        let slot = &self.shared.slots[(next & TIME_BOUNDS_MASK) as usize];
        slot.update_counter.store(SLOT_WRITING, Ordering::Relaxed);
        fence(Ordering::Release);
        slot.start.store(start, Ordering::Relaxed);
        slot.end.store(end, Ordering::Relaxed);
        slot.update_counter.store(next, Ordering::Release);
        self.shared.current.store(next, Ordering::Release);
    }

    /// Writes `frame_count` frames of `block` (one slice per channel) at `start_write`.
    ///
    /// Writing before the current end discards everything and restarts the window
    /// at `start_write`. Writing past `start + capacity` drops the oldest frames.
    ///
    /// # Errors
    ///
    /// [`RingBufferError::TooMuch`] when `frame_count` exceeds the capacity.
    pub fn store<B: AsRef<[f32]>>(
        &mut self,
        block: &[B],
        frame_count: usize,
        start_write: i64,
    ) -> Result<(), RingBufferError> {
        let capacity = self.shared.capacity;
        if frame_count > capacity {
            return Err(RingBufferError::TooMuch);
        }
        let end_write = start_write + frame_count as i64;

        if start_write < self.end_time() {
            self.set_time_bounds(start_write, start_write);
        } else if end_write - self.start_time() > capacity as i64 {
            let new_start = end_write - capacity as i64;
            let new_end = new_start.max(self.end_time());
            self.set_time_bounds(new_start, new_end);
        }

        // publish the reclaimed window before overwriting it
        fence(Ordering::Release);

        let cur_end = self.end_time();
        if start_write > cur_end {
            let gap = (start_write - cur_end) as usize;
            let mut offset = self.shared.frame_offset(cur_end);
            for _ in 0..gap.min(capacity) {
                for channel in self.shared.channels.iter() {
                    channel[offset].store(0.0, Ordering::Relaxed);
                }
                offset = (offset + 1) & self.shared.mask;
            }
        }

        for (channel, src) in self.shared.channels.iter().zip(block.iter()) {
            let src = src.as_ref();
            let mut offset = self.shared.frame_offset(start_write);
            for frame in 0..frame_count {
                let value = src.get(frame).copied().unwrap_or(0.0);
                channel[offset].store(value, Ordering::Relaxed);
                offset = (offset + 1) & self.shared.mask;
            }
        }

        let start = self.start_time();
        self.set_time_bounds(start, end_write);
        Ok(())
    }

    /// Reads `frame_count` frames starting at `start_read` into `out`.
    ///
    /// Whatever part of the window is still buffered is copied and the rest is
    /// zeroed, even when an error is returned.
    pub fn fetch<B: AsMut<[f32]>>(
        &self,
        out: &mut [B],
        frame_count: usize,
        start_read: i64,
    ) -> Result<(), RingBufferError> {
        self.shared.fetch(out, frame_count, start_read)
    }

    /// Classifies `[start_read, end_read)` against the published window.
    pub fn check_time_bounds(&self, start_read: i64, end_read: i64) -> Result<(), RingBufferError> {
        self.shared.check_time_bounds(start_read, end_read)
    }

    /// Forgets all content. The next store starts a fresh window.
    pub fn clear(&mut self) {
        self.set_time_bounds(0, 0);
    }
}

impl RingReader {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn channels(&self) -> usize {
        self.shared.channels.len()
    }

    pub fn time_bounds(&self) -> Result<(i64, i64), RingBufferError> {
        self.shared.time_bounds()
    }

    pub fn fetch<B: AsMut<[f32]>>(
        &self,
        out: &mut [B],
        frame_count: usize,
        start_read: i64,
    ) -> Result<(), RingBufferError> {
        self.shared.fetch(out, frame_count, start_read)
    }

    pub fn check_time_bounds(&self, start_read: i64, end_read: i64) -> Result<(), RingBufferError> {
        self.shared.check_time_bounds(start_read, end_read)
    }
}
