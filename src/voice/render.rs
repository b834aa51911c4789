//! Render-thread side of a voice: pre-render, render and post-render.
//!
//! Nothing here blocks. Every lock is taken with `try_lock`; losing the race
//! means the voice is silent for one block, or its deferred commands wait for
//! the next one.

use super::{RampState, RateScale, SourceType, Voice, VoiceCore, VoiceState};
use crate::arena::VoiceId;
use crate::audio_data::AudioFormat;
use crate::bus::{BusId, BusParams, BusPool};
use crate::command::{DeferredCommand, DeferredCommandChannel};
use crate::converter::ConverterRegistry;
use crate::error::{PetalSonicError, Result};
use crate::events::{EventSink, PetalSonicEvent};
use crate::queue::{BufferInfo, BufferQueue, ProcessedState};
use crate::spatial::{ListenerState, SpatialEnvironment, spatialize};
use std::sync::atomic::Ordering;

/// Context-wide inputs to one render cycle.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext {
    pub listener: ListenerState,
    pub environment: SpatialEnvironment,
    pub output_rate: u32,
}

/// Outcome of one pull from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullSignal {
    Delivered(usize),
    Advanced,
    LoopedToStart,
    Drained,
}

/// Reads converted frames out of a voice's queue.
pub struct QueueReader {
    pub(crate) queue: BufferQueue,
    pub(crate) converters: ConverterRegistry,
    pub(crate) looping: bool,
    loops: u32,
}

impl QueueReader {
    pub(crate) fn new() -> Self {
        Self {
            queue: BufferQueue::new(),
            converters: ConverterRegistry::new(),
            looping: false,
            loops: 0,
        }
    }

    /// Writes up to `frames` frames into `out[..][offset..]` and returns how
    /// many were written. Stops early when the queue drains or when the next
    /// buffer has another sample rate; only a drained queue yields zero.
    pub fn fill(&mut self, out: &mut [Vec<f32>], offset: usize, frames: usize) -> usize {
        if frames == 0 || !self.begin() {
            return 0;
        }

        let mut segment_rate = None;
        let mut written = 0;
        while written < frames && !self.queue.is_drained() {
            let rate = self
                .queue
                .current()
                .filter(|entry| entry.frames_left() > 0)
                .map(|entry| entry.buffer.format().sample_rate);
            if let (Some(segment), Some(rate)) = (segment_rate, rate) {
                if segment != rate {
                    break;
                }
            }
            match self.pull(out, offset + written, frames - written) {
                PullSignal::Delivered(count) => {
                    written += count;
                    segment_rate = segment_rate.or(rate);
                }
                PullSignal::LoopedToStart => self.loops += 1,
                PullSignal::Advanced => {}
                PullSignal::Drained => break,
            }
        }
        written
    }

    /// Format of the next frame the queue will deliver.
    pub fn upcoming_format(&self) -> Option<AudioFormat> {
        let queue = &self.queue;
        let active = queue.active();
        let ahead = (queue.current_index()..active.len())
            .filter_map(|index| active.get(index))
            .find(|entry| entry.frames_left() > 0);
        let next = match ahead {
            Some(entry) => Some(entry),
            None if self.looping => queue.iter().find(|entry| entry.is_playable()),
            None => None,
        };
        next.map(|entry| *entry.buffer.format())
    }

    pub fn source_rate(&self) -> Option<u32> {
        self.upcoming_format().map(|format| format.sample_rate)
    }

    pub fn is_drained(&self) -> bool {
        self.queue.is_drained()
    }

    /// Loops completed since the last call.
    pub(crate) fn take_loops(&mut self) -> u32 {
        std::mem::take(&mut self.loops)
    }

    /// Positions the queue on a playable entry.
    fn begin(&mut self) -> bool {
        if self.queue.is_drained() {
            return false;
        }
        if self.queue.next_playable_in_active().is_some() {
            self.queue.update_queue();
            return true;
        }
        if self.looping {
            self.queue.loop_to_beginning();
            if self.queue.next_playable_in_active().is_some() {
                self.queue.update_queue();
                self.loops += 1;
                return true;
            }
        }
        self.queue.set_drained(true);
        false
    }

    fn pull(&mut self, out: &mut [Vec<f32>], offset: usize, wanted: usize) -> PullSignal {
        let delivered = match self.queue.current_mut() {
            Some(entry) if entry.frames_left() > 0 => {
                entry.processed = ProcessedState::InProgress;
                let count = entry.frames_left().min(wanted);
                let start = entry.current_frame();
                copy_frames(entry, &mut self.converters, start, count, out, offset);
                entry.offset += count * entry.buffer.format().bytes_per_frame();
                count
            }
            _ => 0,
        };
        if delivered > 0 {
            return PullSignal::Delivered(delivered);
        }
        self.advance()
    }

    /// Retires the exhausted entry and moves to the next playable one.
    fn advance(&mut self) -> PullSignal {
        let index = self.queue.current_index();
        if let Some(entry) = self.queue.current_mut() {
            entry.processed = ProcessedState::Processed;
            entry.offset = 0;
            self.queue.set_current_index(index + 1);
        }

        if self.queue.next_playable_in_active().is_some() {
            self.queue.update_queue();
            return PullSignal::Advanced;
        }
        if self.looping {
            self.queue.loop_to_beginning();
            if self.queue.next_playable_in_active().is_some() {
                self.queue.update_queue();
                return PullSignal::LoopedToStart;
            }
        }
        self.queue.set_drained(true);
        PullSignal::Drained
    }
}

fn copy_frames(
    entry: &BufferInfo,
    converters: &mut ConverterRegistry,
    start: usize,
    count: usize,
    out: &mut [Vec<f32>],
    offset: usize,
) {
    if let Some(token) = entry.converter {
        match converters.get_mut(token) {
            Some(converter) => converter.convert(&entry.buffer, start, count, out, offset),
            None => {
                for dest in out.iter_mut() {
                    dest[offset..offset + count].fill(0.0);
                }
            }
        }
        return;
    }

    let last_channel = entry.buffer.channels() as usize - 1;
    for (channel, dest) in out.iter_mut().enumerate() {
        let dest = &mut dest[offset..offset + count];
        match entry.buffer.canonical_plane(channel.min(last_channel)) {
            Some(plane) => dest.copy_from_slice(&plane[start..start + count]),
            None => dest.fill(0.0),
        }
    }
}

/// Reconfigures the bus when the queue moves on to a buffer with another
/// rate or channel count.
fn follow_format(
    buses: &mut BusPool,
    bus_id: BusId,
    format: &AudioFormat,
    resample: bool,
) -> Result<()> {
    let Some(bus) = buses.get(bus_id) else {
        return Ok(());
    };
    if bus.source_rate() == format.sample_rate && bus.channels() == format.channels {
        return Ok(());
    }
    log::debug!(
        "{} follows the queue to {} Hz, {} channels",
        bus_id,
        format.sample_rate,
        format.channels
    );
    buses.configure(bus_id, format.sample_rate, format.channels, resample)
}

/// Linear fade over the block, then marks the ramp complete.
fn apply_ramp(out: &mut [Vec<f32>], frames: usize, ramp: &mut RampState) {
    let (from, to) = match *ramp {
        RampState::RampDown => (1.0f32, 0.0f32),
        RampState::RampUp => (0.0, 1.0),
        RampState::NoRamping | RampState::RampingComplete => return,
    };
    if frames > 0 {
        let step = (to - from) / frames as f32;
        for plane in out.iter_mut() {
            for (i, sample) in plane[..frames].iter_mut().enumerate() {
                *sample *= from + step * i as f32;
            }
        }
    }
    *ramp = RampState::RampingComplete;
}

enum Applied {
    Continue,
    Started,
    Paused,
    Stopped,
    TornDown,
}

impl VoiceCore {
    fn apply(
        &mut self,
        command: DeferredCommand,
        buses: &mut BusPool,
        commands: &DeferredCommandChannel,
        detached_by_pause: &mut bool,
    ) -> Result<Applied> {
        match command {
            DeferredCommand::Stop => {
                if self.state != VoiceState::Stopped {
                    self.disconnect(buses);
                    self.state = VoiceState::Stopped;
                    self.transitioning_to_flush = false;
                    self.reader.queue.clear_active_queue();
                    self.reader.queue.set_drained(false);
                    return Ok(Applied::Stopped);
                }
            }
            DeferredCommand::Rewind => {
                self.reader.queue.loop_to_beginning();
                self.strategy.reset();
                if self.bus.is_some() {
                    if *detached_by_pause {
                        self.attached = true;
                        *detached_by_pause = false;
                    }
                    if self.attached {
                        self.state = VoiceState::Playing;
                    }
                }
            }
            DeferredCommand::RemoveBuffers(count) => {
                let queue = &mut self.reader.queue;
                queue.clear_active_queue();
                let discarded = queue.discard_from_inactive(count);
                if queue.is_empty() {
                    self.source_type = SourceType::Undetermined;
                }
                if discarded < count {
                    return Err(PetalSonicError::InvalidOperation(format!(
                        "Only {} of {} slated buffers were left to remove",
                        discarded, count
                    )));
                }
            }
            DeferredCommand::SetBuffer(buffer) => {
                self.disconnect(buses);
                self.reader.queue.flush();
                self.source_type = match buffer {
                    Some((id, data)) => {
                        let converter = self.reader.converters.token_for(data.format())?;
                        self.reader
                            .queue
                            .append_buffer(BufferInfo::new(id, data, converter));
                        SourceType::Static
                    }
                    None => SourceType::Undetermined,
                };
                self.transitioning_to_flush = false;
                self.state = VoiceState::Stopped;
            }
            DeferredCommand::Play => {
                let was_playing = self.state == VoiceState::Playing;
                self.play(buses, commands)?;
                if !was_playing && self.state == VoiceState::Playing {
                    return Ok(Applied::Started);
                }
            }
            DeferredCommand::Pause => {
                if self.state == VoiceState::Playing {
                    self.state = VoiceState::Paused;
                    self.attached = false;
                    *detached_by_pause = true;
                    return Ok(Applied::Paused);
                }
            }
            DeferredCommand::SetFramePosition(frame) => {
                self.reader.queue.loop_to_beginning();
                self.strategy.reset();
                self.reader.queue.advance_to_frame_index(frame)?;
            }
            DeferredCommand::TeardownForDeletion => {
                self.teardown(buses);
                return Ok(Applied::TornDown);
            }
        }
        Ok(Applied::Continue)
    }

    pub(super) fn teardown(&mut self, buses: &mut BusPool) {
        self.disconnect(buses);
        self.state = VoiceState::Stopped;
        self.ramp = RampState::NoRamping;
        self.reader.queue.flush();
        self.reader.converters.dispose_all();
        log::debug!("Voice torn down");
    }
}

impl Voice {
    /// Marks an attached voice drained when nothing is left at its cursor.
    pub(crate) fn pre_render(&self) {
        let Some(mut core) = self.core.try_lock() else {
            return;
        };
        if !core.attached || core.cached_params.looping {
            return;
        }
        if core.reader.queue.current().is_none() {
            core.reader.queue.set_drained(true);
        }
    }

    /// Publishes bus parameters and writes this block's frames into the bus.
    pub(crate) fn render(
        &self,
        voice_id: VoiceId,
        buses: &mut BusPool,
        ctx: &RenderContext,
        events: &EventSink,
    ) {
        let Some(mut guard) = self.core.try_lock() else {
            log::trace!("{} busy, skipping render", voice_id);
            return;
        };
        let core = &mut *guard;
        if !core.attached {
            return;
        }
        let Some(bus_id) = core.bus else {
            return;
        };
        if let Some(params) = self.params.try_lock() {
            core.cached_params = *params;
        }
        let params = core.cached_params;
        core.reader.looping = params.looping;

        if let Some(format) = core.reader.upcoming_format() {
            let resample = core.strategy.resamples_in_mixer();
            if let Err(e) = follow_format(buses, bus_id, &format, resample) {
                log::warn!("{} keeps its bus format: {}", voice_id, e);
            }
        }

        let Some(bus) = buses.get(bus_id) else {
            return;
        };
        let spatialized = bus.channels() == 1;
        let spatial = spatialize(&ctx.listener, &params, &ctx.environment, spatialized);
        let pitch_scale = params.pitch * spatial.doppler;
        buses.publish(
            bus_id,
            BusParams {
                gain: spatial.gain,
                azimuth: spatial.azimuth,
                elevation: spatial.elevation,
                distance: spatial.distance,
                pitch_scale,
                spatialized,
                distance_model: ctx.environment.distance_model,
                reference_distance: params.reference_distance,
                max_distance: params.max_distance,
                rolloff_factor: params.rolloff_factor,
            },
        );

        let Some(bus) = buses.get_mut(bus_id) else {
            return;
        };
        let frames = bus.begin_block();
        let scale = RateScale {
            output_rate: ctx.output_rate,
            pitch_scale: pitch_scale as f64,
        };
        let out = bus.input_mut();
        core.strategy.render(&mut core.reader, out, frames, scale);
        apply_ramp(out, frames, &mut core.ramp);
        bus.mark_rendered();

        if core.reader.take_loops() > 0 {
            events.emit(PetalSonicEvent::VoiceLooped { voice_id });
        }
    }

    /// Applies deferred commands and stops a voice whose queue ran dry.
    pub(crate) fn post_render(&self, voice_id: VoiceId, buses: &mut BusPool, events: &EventSink) {
        let Some(mut guard) = self.core.try_lock() else {
            return;
        };
        if self.safe_for_deletion.load(Ordering::Acquire) {
            return;
        }
        let core = &mut *guard;

        if !core.attached || core.ramp != RampState::RampDown {
            let mut detached_by_pause = false;
            // commands pushed while draining wait for the next block
            let pending = self.commands.len();
            for _ in 0..pending {
                let Some(command) = self.commands.pop() else {
                    break;
                };
                log::debug!("{} applying {:?}", voice_id, command);
                match core.apply(command, buses, &self.commands, &mut detached_by_pause) {
                    Ok(Applied::Continue) => {}
                    Ok(Applied::Started) => {
                        events.emit(PetalSonicEvent::VoiceStarted { voice_id });
                    }
                    Ok(Applied::Paused) => {
                        events.emit(PetalSonicEvent::VoicePaused { voice_id });
                    }
                    Ok(Applied::Stopped) => {
                        events.emit(PetalSonicEvent::VoiceStopped { voice_id });
                    }
                    Ok(Applied::TornDown) => {
                        self.commands.clear();
                        self.safe_for_deletion.store(true, Ordering::Release);
                        return;
                    }
                    Err(e) => {
                        log::warn!("{} deferred command failed: {}", voice_id, e);
                        events.emit(PetalSonicEvent::CommandFailed {
                            voice_id,
                            error: e.to_string(),
                        });
                    }
                }
            }
            if core.ramp != RampState::RampUp {
                core.ramp = RampState::NoRamping;
            }
        }

        if core.attached && core.reader.queue.is_drained() && !core.strategy.holds_frames() {
            core.disconnect(buses);
            core.state = VoiceState::Stopped;
            core.reader.queue.clear_active_queue();
            log::debug!("{} drained", voice_id);
            events.emit(PetalSonicEvent::VoiceCompleted { voice_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramp_down_is_linear() {
        let mut out = vec![vec![1.0f32; 4]];
        let mut ramp = RampState::RampDown;
        apply_ramp(&mut out, 4, &mut ramp);
        assert_eq!(out[0], vec![1.0, 0.75, 0.5, 0.25]);
        assert_eq!(ramp, RampState::RampingComplete);
    }

    #[test]
    fn test_ramp_up_starts_silent() {
        let mut out = vec![vec![1.0f32; 4]; 2];
        let mut ramp = RampState::RampUp;
        apply_ramp(&mut out, 4, &mut ramp);
        assert_eq!(out[1], vec![0.0, 0.25, 0.5, 0.75]);
    }

    #[test]
    fn test_no_ramp_leaves_samples() {
        let mut out = vec![vec![0.5f32; 2]];
        let mut ramp = RampState::NoRamping;
        apply_ramp(&mut out, 2, &mut ramp);
        assert_eq!(out[0], vec![0.5, 0.5]);
        assert_eq!(ramp, RampState::NoRamping);
    }
}
