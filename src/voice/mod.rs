//! Streaming voices.
//!
//! A [`Voice`] owns a buffer queue, a converter registry, a deferred command
//! channel and the playback state machine. Control calls mutate it directly
//! whenever that cannot disturb an in-flight render; anything else becomes a
//! [`DeferredCommand`] that the render thread applies in post-render, once any
//! ramp-down has finished.
//!
//! Locking: the voice core mutex is the render-exclusion token. The render
//! thread only ever `try_lock`s it; control calls `lock()` and therefore wait
//! out at most one render cycle. Callers that also need the [`BusPool`] must
//! lock the pool before calling in.

mod params;
mod render;
mod strategy;

pub use params::VoiceParams;
pub use render::{QueueReader, RenderContext};
pub use strategy::{DirectRender, InterpolatingRender, RateScale, RenderStrategy};

use crate::arena::BufferId;
use crate::audio_data::{AudioBuffer, AudioFormat};
use crate::bus::{BusId, BusPool};
use crate::command::{DeferredCommand, DeferredCommandChannel};
use crate::error::{PetalSonicError, Result};
use crate::math::Vec3;
use crate::queue::BufferInfo;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Initial,
    Playing,
    Paused,
    Stopped,
    /// Stop was requested and waits for post-render.
    Transitioning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampState {
    NoRamping,
    RampUp,
    RampDown,
    RampingComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Undetermined,
    /// One buffer set with `set_buffer`
    Static,
    /// Buffers appended with `queue_buffers`
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetUnit {
    Seconds,
    /// Sample frames
    Samples,
    Bytes,
}

pub(crate) struct VoiceCore {
    state: VoiceState,
    source_type: SourceType,
    ramp: RampState,
    reader: QueueReader,
    strategy: Box<dyn RenderStrategy>,
    bus: Option<BusId>,
    attached: bool,
    transitioning_to_flush: bool,
    /// Offset set while stopped, applied by the next play.
    pending_start_frame: Option<usize>,
    cached_params: VoiceParams,
}

impl VoiceCore {
    fn new(strategy: Box<dyn RenderStrategy>) -> Self {
        Self {
            state: VoiceState::Initial,
            source_type: SourceType::Undetermined,
            ramp: RampState::NoRamping,
            reader: QueueReader::new(),
            strategy,
            bus: None,
            attached: false,
            transitioning_to_flush: false,
            pending_start_frame: None,
            cached_params: VoiceParams::default(),
        }
    }

    fn make_entry(&mut self, id: BufferId, buffer: Arc<AudioBuffer>) -> Result<BufferInfo> {
        let converter = self.reader.converters.token_for(buffer.format())?;
        Ok(BufferInfo::new(id, buffer, converter))
    }

    fn play(&mut self, buses: &mut BusPool, commands: &DeferredCommandChannel) -> Result<()> {
        if self.reader.queue.is_empty() {
            return Ok(());
        }

        match self.state {
            VoiceState::Playing => {
                if self.ramp != RampState::RampingComplete {
                    commands.push(DeferredCommand::Rewind)?;
                    self.ramp = RampState::RampDown;
                }
                Ok(())
            }
            VoiceState::Paused => {
                self.resume();
                Ok(())
            }
            VoiceState::Transitioning => {
                if self.ramp != RampState::RampingComplete {
                    commands.push(DeferredCommand::Play)?;
                    self.ramp = RampState::RampDown;
                }
                Ok(())
            }
            VoiceState::Initial | VoiceState::Stopped => self.start(buses),
        }
    }

    fn start(&mut self, buses: &mut BusPool) -> Result<()> {
        let queue = &mut self.reader.queue;
        queue.join_buffer_lists();
        if let Some(frame) = self.pending_start_frame.take() {
            if let Err(e) = queue.advance_to_frame_index(frame) {
                log::warn!("Dropping start offset: {}", e);
                queue.join_buffer_lists();
            }
        }
        for entry in queue.iter() {
            entry.buffer.warm();
        }

        let Some(head) = queue.current() else {
            return Ok(());
        };
        let format = *head.buffer.format();
        if let Some(converter) = head
            .converter
            .and_then(|token| self.reader.converters.get_mut(token))
        {
            converter.reset();
        }

        let bus = match self.bus {
            Some(bus) => bus,
            None => buses.acquire()?,
        };
        if let Err(e) = buses.configure(
            bus,
            format.sample_rate,
            format.channels,
            self.strategy.resamples_in_mixer(),
        ) {
            if self.bus.is_none() {
                buses.release(bus);
            }
            return Err(e);
        }

        self.bus = Some(bus);
        self.strategy.reset();
        self.reader.queue.set_drained(false);
        self.state = VoiceState::Playing;
        self.ramp = RampState::NoRamping;
        self.attached = true;
        log::debug!("Voice started on {}", bus);
        Ok(())
    }

    fn resume(&mut self) {
        if self.state == VoiceState::Paused {
            self.ramp = RampState::RampUp;
            self.attached = true;
            self.state = VoiceState::Playing;
        }
    }

    fn stop(&mut self, buses: &mut BusPool, commands: &DeferredCommandChannel) -> Result<()> {
        match self.state {
            VoiceState::Paused => {
                self.disconnect(buses);
                self.state = VoiceState::Stopped;
            }
            VoiceState::Playing => {
                commands.push(DeferredCommand::Stop)?;
                self.state = VoiceState::Transitioning;
                if self.ramp != RampState::RampingComplete {
                    self.ramp = RampState::RampDown;
                }
            }
            VoiceState::Transitioning => commands.push(DeferredCommand::Stop)?,
            VoiceState::Initial | VoiceState::Stopped => {}
        }
        Ok(())
    }

    fn pause(&mut self, commands: &DeferredCommandChannel) -> Result<()> {
        if self.state == VoiceState::Playing {
            commands.push(DeferredCommand::Pause)?;
            self.ramp = RampState::RampDown;
        }
        Ok(())
    }

    fn rewind(&mut self, commands: &DeferredCommandChannel) -> Result<()> {
        match self.state {
            VoiceState::Playing => {
                commands.push(DeferredCommand::Rewind)?;
                self.ramp = RampState::RampDown;
                self.reader.queue.loop_to_beginning();
            }
            VoiceState::Paused | VoiceState::Stopped => {
                self.pending_start_frame = None;
                self.reader.queue.loop_to_beginning();
            }
            VoiceState::Initial | VoiceState::Transitioning => {}
        }
        Ok(())
    }

    /// Detaches from the mixer and gives the bus back.
    fn disconnect(&mut self, buses: &mut BusPool) {
        self.attached = false;
        if let Some(bus) = self.bus.take() {
            buses.release(bus);
        }
    }

    fn set_buffer(
        &mut self,
        buffer: Option<(BufferId, Arc<AudioBuffer>)>,
        commands: &DeferredCommandChannel,
    ) -> Result<()> {
        match self.state {
            VoiceState::Playing | VoiceState::Paused => Err(PetalSonicError::InvalidOperation(
                "Cannot replace the buffer of a playing or paused voice".into(),
            )),
            VoiceState::Transitioning => {
                if let Some((_, data)) = &buffer {
                    self.reader.converters.token_for(data.format())?;
                }
                let flush = buffer.is_none();
                commands.push(DeferredCommand::SetBuffer(buffer))?;
                if flush {
                    self.transitioning_to_flush = true;
                    self.source_type = SourceType::Undetermined;
                } else {
                    self.source_type = SourceType::Static;
                }
                Ok(())
            }
            VoiceState::Initial | VoiceState::Stopped => {
                let entry = match buffer {
                    Some((id, data)) => Some(self.make_entry(id, data)?),
                    None => None,
                };
                self.reader.queue.flush();
                self.pending_start_frame = None;
                self.source_type = match entry {
                    Some(entry) => {
                        self.reader.queue.append_buffer(entry);
                        SourceType::Static
                    }
                    None => SourceType::Undetermined,
                };
                Ok(())
            }
        }
    }

    fn queue_buffers(&mut self, buffers: &[(BufferId, Arc<AudioBuffer>)]) -> Result<()> {
        if self.source_type == SourceType::Static {
            return Err(PetalSonicError::InvalidOperation(
                "Cannot queue buffers on a static voice".into(),
            ));
        }
        if self.state == VoiceState::Transitioning && self.transitioning_to_flush {
            return Err(PetalSonicError::InvalidOperation(
                "Cannot queue buffers while the queue is being flushed".into(),
            ));
        }
        if buffers.is_empty() {
            return Ok(());
        }

        let entries = buffers
            .iter()
            .map(|(id, data)| self.make_entry(*id, Arc::clone(data)))
            .collect::<Result<Vec<_>>>()?;
        for entry in entries {
            self.reader.queue.append_buffer(entry);
        }
        if self.source_type == SourceType::Undetermined {
            self.source_type = SourceType::Streaming;
        }
        Ok(())
    }

    fn remove_buffers(
        &mut self,
        count: usize,
        looping: bool,
        commands: &DeferredCommandChannel,
    ) -> Result<Vec<BufferId>> {
        let queue_length = self.reader.queue.len();
        if count > queue_length {
            return Err(PetalSonicError::InvalidOperation(format!(
                "Cannot remove {} buffers from a queue of {}",
                count, queue_length
            )));
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let removed = match self.state {
            VoiceState::Transitioning => {
                let queue = &self.reader.queue;
                let ids: Vec<BufferId> = queue
                    .iter()
                    .skip(queue.queued_for_clear())
                    .take(count)
                    .map(|entry| entry.buffer_id)
                    .collect();
                commands.push(DeferredCommand::RemoveBuffers(count))?;
                self.reader.queue.add_queued_for_clear(count);
                ids
            }
            VoiceState::Playing | VoiceState::Paused => {
                if looping {
                    return Err(PetalSonicError::InvalidOperation(
                        "Cannot remove buffers from a looping voice while it plays".into(),
                    ));
                }
                if self.reader.queue.is_drained() {
                    self.reader.queue.clear_active_queue();
                }
                self.release_processed(count)?
            }
            VoiceState::Stopped => {
                self.reader.queue.clear_active_queue();
                self.release_processed(count)?
            }
            VoiceState::Initial => self.release_processed(count)?,
        };

        if self.reader.queue.is_empty() {
            self.source_type = SourceType::Undetermined;
        }
        Ok(removed)
    }

    fn release_processed(&mut self, count: usize) -> Result<Vec<BufferId>> {
        let processed = self.reader.queue.inactive().len();
        if count > processed {
            return Err(PetalSonicError::InvalidOperation(format!(
                "Only {} of the {} buffers to remove have been processed",
                processed, count
            )));
        }
        Ok(self.reader.queue.release_from_inactive(count))
    }

    fn buffers_processed(&mut self) -> usize {
        match self.state {
            VoiceState::Initial => 0,
            VoiceState::Transitioning => self.reader.queue.len(),
            _ => {
                let queue = &mut self.reader.queue;
                if queue.is_drained() {
                    queue.clear_active_queue();
                }
                queue
                    .inactive()
                    .len()
                    .saturating_sub(queue.queued_for_clear())
            }
        }
    }

    /// Converts a queue offset to frames, walking the queue so every buffer
    /// contributes at its own rate and frame size.
    fn to_frames(&self, unit: OffsetUnit, value: f64) -> Result<usize> {
        if !value.is_finite() || value < 0.0 {
            return Err(PetalSonicError::InvalidValue(format!(
                "Offset {} must be a non-negative number",
                value
            )));
        }
        let mut remaining = value;
        let mut frames = 0;
        let mut last_format = None;
        for entry in self.reader.queue.iter() {
            let format = entry.buffer.format();
            let count = entry.buffer.total_frames();
            let length = frames_in_unit(format, unit, count);
            if remaining < length {
                return Ok(frames + unit_in_frames(format, unit, remaining));
            }
            remaining -= length;
            frames += count;
            last_format = Some(*format);
        }
        Ok(frames + last_format.map_or(0, |format| unit_in_frames(&format, unit, remaining)))
    }

    fn from_frames(&self, unit: OffsetUnit, frames: usize) -> f64 {
        let mut left = frames;
        let mut value = 0.0;
        let mut last_format = None;
        for entry in self.reader.queue.iter() {
            let format = entry.buffer.format();
            let count = entry.buffer.total_frames();
            if left <= count {
                return value + frames_in_unit(format, unit, left);
            }
            value += frames_in_unit(format, unit, count);
            left -= count;
            last_format = Some(*format);
        }
        value + last_format.map_or(0.0, |format| frames_in_unit(&format, unit, left))
    }

    fn set_queue_offset(
        &mut self,
        unit: OffsetUnit,
        value: f64,
        commands: &DeferredCommandChannel,
    ) -> Result<()> {
        let frame = self.to_frames(unit, value)?;
        let total: usize = self
            .reader
            .queue
            .iter()
            .map(|entry| entry.buffer.total_frames())
            .sum();
        if frame > total {
            return Err(PetalSonicError::InvalidValue(format!(
                "Offset {} frames is beyond the queue length of {} frames",
                frame, total
            )));
        }

        match self.state {
            VoiceState::Initial | VoiceState::Stopped => {
                self.reader.queue.loop_to_beginning();
                self.reader.queue.advance_to_frame_index(frame)?;
                self.pending_start_frame = Some(frame);
            }
            VoiceState::Paused => {
                self.reader.queue.loop_to_beginning();
                self.reader.queue.advance_to_frame_index(frame)?;
            }
            VoiceState::Playing | VoiceState::Transitioning => {
                commands.push(DeferredCommand::SetFramePosition(frame))?;
                self.ramp = RampState::RampDown;
            }
        }
        Ok(())
    }

    fn queue_offset(&self, unit: OffsetUnit) -> f64 {
        let frames = match self.pending_start_frame {
            Some(frame) => frame,
            None => self.reader.queue.offset_in_frames(),
        };
        self.from_frames(unit, frames)
    }
}

fn frames_in_unit(format: &AudioFormat, unit: OffsetUnit, frames: usize) -> f64 {
    match unit {
        OffsetUnit::Seconds => frames as f64 / format.sample_rate as f64,
        OffsetUnit::Samples => frames as f64,
        OffsetUnit::Bytes => (frames * format.bytes_per_frame()) as f64,
    }
}

fn unit_in_frames(format: &AudioFormat, unit: OffsetUnit, value: f64) -> usize {
    let frames = match unit {
        OffsetUnit::Seconds => value * format.sample_rate as f64,
        OffsetUnit::Samples => value,
        OffsetUnit::Bytes => value / format.bytes_per_frame() as f64,
    };
    frames.floor() as usize
}

/// One playing stream: queue, converters, state machine and parameters.
pub struct Voice {
    core: Mutex<VoiceCore>,
    params: Mutex<VoiceParams>,
    commands: DeferredCommandChannel,
    safe_for_deletion: AtomicBool,
}

impl Voice {
    pub fn new(strategy: Box<dyn RenderStrategy>, command_capacity: usize) -> Self {
        Self {
            core: Mutex::new(VoiceCore::new(strategy)),
            params: Mutex::new(VoiceParams::default()),
            commands: DeferredCommandChannel::new(command_capacity),
            safe_for_deletion: AtomicBool::new(false),
        }
    }

    /// Starts, restarts or resumes playback.
    ///
    /// # Errors
    ///
    /// - [`PetalSonicError::Resource`] when no bus is free or the command
    ///   channel is full. The state is left unchanged.
    pub fn play(&self, buses: &mut BusPool) -> Result<()> {
        self.core.lock().play(buses, &self.commands)
    }

    pub fn stop(&self, buses: &mut BusPool) -> Result<()> {
        self.core.lock().stop(buses, &self.commands)
    }

    pub fn pause(&self) -> Result<()> {
        self.core.lock().pause(&self.commands)
    }

    pub fn resume(&self) {
        self.core.lock().resume();
    }

    pub fn rewind(&self) -> Result<()> {
        self.core.lock().rewind(&self.commands)
    }

    /// Replaces the whole queue with `buffer`, or empties it for `None`.
    pub fn set_buffer(&self, buffer: Option<(BufferId, Arc<AudioBuffer>)>) -> Result<()> {
        self.core.lock().set_buffer(buffer, &self.commands)
    }

    /// Appends `buffers` in order. Nothing is queued if any of them fails.
    pub fn queue_buffers(&self, buffers: &[(BufferId, Arc<AudioBuffer>)]) -> Result<()> {
        self.core.lock().queue_buffers(buffers)
    }

    /// Unqueues `count` buffers from the head and returns their ids.
    pub fn remove_buffers(&self, count: usize) -> Result<Vec<BufferId>> {
        let looping = self.params.lock().looping;
        self.core.lock().remove_buffers(count, looping, &self.commands)
    }

    /// Public state; a pending stop already reads as stopped.
    pub fn state(&self) -> VoiceState {
        match self.raw_state() {
            VoiceState::Transitioning => VoiceState::Stopped,
            state => state,
        }
    }

    pub fn raw_state(&self) -> VoiceState {
        self.core.lock().state
    }

    pub fn ramp_state(&self) -> RampState {
        self.core.lock().ramp
    }

    pub fn source_type(&self) -> SourceType {
        self.core.lock().source_type
    }

    pub fn queue_length(&self) -> usize {
        self.core.lock().reader.queue.len()
    }

    pub fn buffers_processed(&self) -> usize {
        self.core.lock().buffers_processed()
    }

    pub fn current_buffer(&self) -> Option<BufferId> {
        self.core.lock().reader.queue.current().map(|entry| entry.buffer_id)
    }

    pub fn bus(&self) -> Option<BusId> {
        self.core.lock().bus
    }

    pub fn converter_count(&self) -> usize {
        self.core.lock().reader.converters.len()
    }

    pub fn set_queue_offset(&self, unit: OffsetUnit, value: f64) -> Result<()> {
        self.core.lock().set_queue_offset(unit, value, &self.commands)
    }

    pub fn queue_offset(&self, unit: OffsetUnit) -> f64 {
        self.core.lock().queue_offset(unit)
    }

    pub fn params(&self) -> VoiceParams {
        *self.params.lock()
    }

    pub fn set_gain(&self, gain: f32) -> Result<()> {
        params::check_non_negative("gain", gain)?;
        self.params.lock().gain = gain;
        Ok(())
    }

    pub fn set_min_gain(&self, gain: f32) -> Result<()> {
        params::check_unit("min gain", gain)?;
        self.params.lock().min_gain = gain;
        Ok(())
    }

    pub fn set_max_gain(&self, gain: f32) -> Result<()> {
        params::check_unit("max gain", gain)?;
        self.params.lock().max_gain = gain;
        Ok(())
    }

    pub fn set_pitch(&self, pitch: f32) -> Result<()> {
        params::check_non_negative("pitch", pitch)?;
        self.params.lock().pitch = pitch;
        Ok(())
    }

    pub fn set_position(&self, position: Vec3) -> Result<()> {
        params::check_finite("position", position)?;
        self.params.lock().position = position;
        Ok(())
    }

    pub fn set_velocity(&self, velocity: Vec3) -> Result<()> {
        params::check_finite("velocity", velocity)?;
        self.params.lock().velocity = velocity;
        Ok(())
    }

    pub fn set_direction(&self, direction: Vec3) -> Result<()> {
        params::check_finite("direction", direction)?;
        self.params.lock().direction = direction;
        Ok(())
    }

    pub fn set_source_relative(&self, relative: bool) {
        self.params.lock().source_relative = relative;
    }

    pub fn set_reference_distance(&self, distance: f32) -> Result<()> {
        params::check_positive("reference distance", distance)?;
        self.params.lock().reference_distance = distance;
        Ok(())
    }

    pub fn set_max_distance(&self, distance: f32) -> Result<()> {
        params::check_non_negative("max distance", distance)?;
        self.params.lock().max_distance = distance;
        Ok(())
    }

    pub fn set_rolloff_factor(&self, rolloff: f32) -> Result<()> {
        params::check_non_negative("rolloff factor", rolloff)?;
        self.params.lock().rolloff_factor = rolloff;
        Ok(())
    }

    pub fn set_cone_inner_angle(&self, degrees: f32) -> Result<()> {
        params::check_angle("cone inner angle", degrees)?;
        self.params.lock().cone_inner_angle = degrees;
        Ok(())
    }

    pub fn set_cone_outer_angle(&self, degrees: f32) -> Result<()> {
        params::check_angle("cone outer angle", degrees)?;
        self.params.lock().cone_outer_angle = degrees;
        Ok(())
    }

    pub fn set_cone_outer_gain(&self, gain: f32) -> Result<()> {
        params::check_unit("cone outer gain", gain)?;
        self.params.lock().cone_outer_gain = gain;
        Ok(())
    }

    pub fn set_looping(&self, looping: bool) {
        self.params.lock().looping = looping;
    }

    /// Asks the render thread to tear the voice down in its next post-render.
    pub(crate) fn request_teardown(&self) -> Result<()> {
        self.commands.push(DeferredCommand::TeardownForDeletion)
    }

    pub fn is_safe_for_deletion(&self) -> bool {
        self.safe_for_deletion.load(Ordering::Acquire)
    }

    /// Tears the voice down on the calling thread, waiting out any render.
    pub(crate) fn teardown_now(&self, buses: &mut BusPool) {
        let mut core = self.core.lock();
        core.teardown(buses);
        self.commands.clear();
        self.safe_for_deletion.store(true, Ordering::Release);
    }

    pub(crate) fn pending_commands(&self) -> usize {
        self.commands.len()
    }
}
