//! The context that owns buffers, voices, buses and the listener.
//!
//! `PetalSonicContext` is the control-side entry point. Every method may be
//! called from any non-realtime thread. [`PetalSonicContext::render_block`]
//! is the single render-thread entry point and never blocks.
//!
//! Lock order is voices, then buses, then a voice's core. The render thread
//! only ever tries its locks and renders silence when it loses a race.

use crate::arena::{Arena, BufferId, VoiceId};
use crate::audio_data::{AudioBuffer, AudioFormat, BufferRegistry, SampleData};
use crate::bus::{BusPool, MixerCapabilities};
use crate::config::{PetalSonicContextDesc, RenderStrategyKind};
use crate::error::{PetalSonicError, Result};
use crate::events::{EventSink, PetalSonicEvent, event_channel};
use crate::math::{Vec3, orthonormal_basis};
use crate::mixer::SoftwareMixer;
use crate::spatial::{DistanceModel, ListenerState, SpatialEnvironment};
use crate::voice::{
    DirectRender, InterpolatingRender, RenderContext, RenderStrategy, Voice, VoiceState,
};
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const EVENT_CAPACITY: usize = 1024;
const TEARDOWN_POLL: Duration = Duration::from_millis(1);
const TEARDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// Snapshot of a registered buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferSummary {
    pub format: AudioFormat,
    pub total_frames: usize,
    pub size_in_bytes: usize,
    /// Queue entries currently holding the buffer
    pub attachments: usize,
}

/// Render-thread state: the mixer plus the last listener and environment it
/// managed to read.
struct Renderer {
    mixer: SoftwareMixer,
    listener: ListenerState,
    environment: SpatialEnvironment,
}

pub struct PetalSonicContext {
    desc: PetalSonicContextDesc,
    capabilities: MixerCapabilities,
    voices: RwLock<Arena<VoiceId, Arc<Voice>>>,
    buffers: Mutex<BufferRegistry>,
    buses: Mutex<BusPool>,
    renderer: Mutex<Renderer>,
    listener: Mutex<ListenerState>,
    environment: Mutex<SpatialEnvironment>,
    events: EventSink,
    event_receiver: Receiver<PetalSonicEvent>,
    render_active: AtomicBool,
}

impl PetalSonicContext {
    pub fn new(desc: PetalSonicContextDesc) -> Result<Self> {
        desc.validate()?;

        let mixer = SoftwareMixer::new(desc.channels, desc.block_size);
        let capabilities = mixer.capabilities();
        let environment = SpatialEnvironment {
            distance_model: desc.distance_model,
            doppler_factor: desc.doppler_factor,
            speed_of_sound: desc.speed_of_sound,
        };
        let (events, event_receiver) = event_channel(EVENT_CAPACITY);

        log::info!(
            "Creating PetalSonic context: {} Hz, {} channels, {} frames per block, {} buses",
            desc.sample_rate,
            desc.channels,
            desc.block_size,
            desc.max_buses
        );

        Ok(Self {
            buses: Mutex::new(BusPool::new(
                desc.max_buses,
                desc.block_size,
                desc.sample_rate,
            )),
            renderer: Mutex::new(Renderer {
                mixer,
                listener: ListenerState::default(),
                environment,
            }),
            desc,
            capabilities,
            voices: RwLock::new(Arena::new()),
            buffers: Mutex::new(BufferRegistry::new()),
            listener: Mutex::new(ListenerState::default()),
            environment: Mutex::new(environment),
            events,
            event_receiver,
            render_active: AtomicBool::new(false),
        })
    }

    pub fn desc(&self) -> &PetalSonicContextDesc {
        &self.desc
    }

    pub fn capabilities(&self) -> MixerCapabilities {
        self.capabilities
    }

    /// Events emitted since the last poll, oldest first.
    pub fn poll_events(&self) -> Vec<PetalSonicEvent> {
        self.event_receiver.try_iter().collect()
    }

    pub(crate) fn event_sink(&self) -> EventSink {
        self.events.clone()
    }

    pub(crate) fn set_render_active(&self, active: bool) {
        self.render_active.store(active, Ordering::Release);
    }

    pub fn create_buffer(&self, format: AudioFormat, data: SampleData) -> Result<BufferId> {
        let buffer = AudioBuffer::new(format, data)?;
        Ok(self.buffers.lock().insert(buffer))
    }

    /// Registers little-endian PCM bytes.
    pub fn create_buffer_from_bytes(&self, format: AudioFormat, bytes: &[u8]) -> Result<BufferId> {
        let buffer = AudioBuffer::from_bytes(format, bytes)?;
        Ok(self.buffers.lock().insert(buffer))
    }

    /// # Errors
    ///
    /// [`PetalSonicError::InvalidOperation`] while any voice still queues the buffer.
    pub fn delete_buffer(&self, id: BufferId) -> Result<()> {
        self.buffers.lock().remove(id)
    }

    pub fn buffer_info(&self, id: BufferId) -> Result<BufferSummary> {
        let buffers = self.buffers.lock();
        let buffer = buffers
            .get(id)
            .ok_or_else(|| PetalSonicError::InvalidValue(format!("Unknown buffer {}", id)))?;
        Ok(BufferSummary {
            format: *buffer.format(),
            total_frames: buffer.total_frames(),
            size_in_bytes: buffer.size_in_bytes(),
            attachments: Arc::strong_count(buffer) - 1,
        })
    }

    fn resolve(&self, ids: &[BufferId]) -> Result<Vec<(BufferId, Arc<AudioBuffer>)>> {
        let buffers = self.buffers.lock();
        ids.iter()
            .map(|&id| {
                buffers
                    .get(id)
                    .map(|data| (id, Arc::clone(data)))
                    .ok_or_else(|| PetalSonicError::InvalidValue(format!("Unknown buffer {}", id)))
            })
            .collect()
    }

    fn make_strategy(&self) -> Box<dyn RenderStrategy> {
        let direct = match self.desc.render_strategy {
            RenderStrategyKind::Auto => self.capabilities.resamples_mono_bus,
            RenderStrategyKind::Direct => true,
            RenderStrategyKind::Interpolating => false,
        };
        if direct {
            Box::new(DirectRender)
        } else {
            Box::new(InterpolatingRender::new(self.desc.block_size, 2))
        }
    }

    pub fn create_voice(&self) -> VoiceId {
        let voice = Arc::new(Voice::new(self.make_strategy(), self.desc.command_capacity));
        let id = self.voices.write().insert(voice);
        log::info!("Created {}", id);
        id
    }

    /// Tears the voice down and forgets it.
    ///
    /// With an engine running the teardown happens in the next post-render and
    /// this call waits for it. Otherwise it runs here.
    pub fn delete_voice(&self, id: VoiceId) -> Result<()> {
        let voice = self.voice(id)?;

        if self.render_active.load(Ordering::Acquire) {
            match voice.request_teardown() {
                Ok(()) => {
                    let deadline = Instant::now() + TEARDOWN_TIMEOUT;
                    while !voice.is_safe_for_deletion() && Instant::now() < deadline {
                        std::thread::sleep(TEARDOWN_POLL);
                    }
                }
                Err(e) => log::warn!("{} teardown could not be deferred: {}", id, e),
            }
        }
        if !voice.is_safe_for_deletion() {
            let mut buses = self.buses.lock();
            voice.teardown_now(&mut buses);
        }

        self.voices.write().remove(id);
        log::info!("Deleted {}", id);
        Ok(())
    }

    /// Shared handle for parameter setters and queries.
    pub fn voice(&self, id: VoiceId) -> Result<Arc<Voice>> {
        self.voices
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PetalSonicError::InvalidValue(format!("Unknown voice {}", id)))
    }

    pub fn voice_count(&self) -> usize {
        self.voices.read().len()
    }

    pub fn play(&self, id: VoiceId) -> Result<()> {
        let voice = self.voice(id)?;
        let before = voice.raw_state();
        voice.play(&mut self.buses.lock())?;
        if before != VoiceState::Playing && voice.raw_state() == VoiceState::Playing {
            self.events.emit(PetalSonicEvent::VoiceStarted { voice_id: id });
        }
        Ok(())
    }

    pub fn stop(&self, id: VoiceId) -> Result<()> {
        let voice = self.voice(id)?;
        let before = voice.raw_state();
        voice.stop(&mut self.buses.lock())?;
        if before == VoiceState::Paused && voice.raw_state() == VoiceState::Stopped {
            self.events.emit(PetalSonicEvent::VoiceStopped { voice_id: id });
        }
        Ok(())
    }

    pub fn pause(&self, id: VoiceId) -> Result<()> {
        self.voice(id)?.pause()
    }

    pub fn resume(&self, id: VoiceId) -> Result<()> {
        let voice = self.voice(id)?;
        if voice.raw_state() == VoiceState::Paused {
            voice.resume();
            self.events.emit(PetalSonicEvent::VoiceStarted { voice_id: id });
        }
        Ok(())
    }

    pub fn rewind(&self, id: VoiceId) -> Result<()> {
        self.voice(id)?.rewind()
    }

    /// Makes the voice static on `buffer`, or empties it for `None`.
    pub fn set_buffer(&self, id: VoiceId, buffer: Option<BufferId>) -> Result<()> {
        let voice = self.voice(id)?;
        let resolved = match buffer {
            Some(buffer) => self.resolve(&[buffer])?.pop(),
            None => None,
        };
        voice.set_buffer(resolved)
    }

    /// Appends `buffers` to a streaming voice. Unknown ids reject the whole call.
    pub fn queue_buffers(&self, id: VoiceId, buffers: &[BufferId]) -> Result<()> {
        let voice = self.voice(id)?;
        let resolved = self.resolve(buffers)?;
        voice.queue_buffers(&resolved)
    }

    pub fn remove_buffers(&self, id: VoiceId, count: usize) -> Result<Vec<BufferId>> {
        self.voice(id)?.remove_buffers(count)
    }

    pub fn listener(&self) -> ListenerState {
        *self.listener.lock()
    }

    pub fn set_listener_position(&self, position: Vec3) -> Result<()> {
        check_finite("listener position", position)?;
        self.listener.lock().position = position;
        Ok(())
    }

    pub fn set_listener_velocity(&self, velocity: Vec3) -> Result<()> {
        check_finite("listener velocity", velocity)?;
        self.listener.lock().velocity = velocity;
        Ok(())
    }

    /// # Errors
    ///
    /// [`PetalSonicError::InvalidValue`] when `at` and `up` are zero or parallel.
    pub fn set_listener_orientation(&self, at: Vec3, up: Vec3) -> Result<()> {
        check_finite("listener at", at)?;
        check_finite("listener up", up)?;
        if orthonormal_basis(at, up).is_none() {
            return Err(PetalSonicError::InvalidValue(
                "Listener at and up vectors must be non-zero and not parallel".into(),
            ));
        }
        let mut listener = self.listener.lock();
        listener.at = at;
        listener.up = up;
        Ok(())
    }

    pub fn set_listener_gain(&self, gain: f32) -> Result<()> {
        if !gain.is_finite() || gain < 0.0 {
            return Err(PetalSonicError::InvalidValue(format!(
                "listener gain {} must not be negative",
                gain
            )));
        }
        self.listener.lock().gain = gain;
        Ok(())
    }

    pub fn environment(&self) -> SpatialEnvironment {
        *self.environment.lock()
    }

    pub fn set_distance_model(&self, model: DistanceModel) {
        self.environment.lock().distance_model = model;
    }

    pub fn set_doppler_factor(&self, factor: f32) -> Result<()> {
        if !factor.is_finite() || factor < 0.0 {
            return Err(PetalSonicError::InvalidValue(format!(
                "doppler factor {} must not be negative",
                factor
            )));
        }
        self.environment.lock().doppler_factor = factor;
        Ok(())
    }

    pub fn set_speed_of_sound(&self, speed: f32) -> Result<()> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(PetalSonicError::InvalidValue(format!(
                "speed of sound {} must be positive",
                speed
            )));
        }
        self.environment.lock().speed_of_sound = speed;
        Ok(())
    }

    /// Runs one render cycle into the interleaved `out` block.
    ///
    /// Never blocks and never fails: on lock contention the block is silent.
    pub fn render_block(&self, out: &mut [f32]) {
        out.fill(0.0);
        let Some(mut renderer) = self.renderer.try_lock() else {
            return;
        };
        let Some(mut buses) = self.buses.try_lock() else {
            log::trace!("Bus pool busy, rendering silence");
            return;
        };
        let Some(voices) = self.voices.try_read() else {
            log::trace!("Voice table busy, rendering silence");
            return;
        };

        if let Some(listener) = self.listener.try_lock() {
            renderer.listener = *listener;
        }
        if let Some(environment) = self.environment.try_lock() {
            renderer.environment = *environment;
        }
        let ctx = RenderContext {
            listener: renderer.listener,
            environment: renderer.environment,
            output_rate: self.desc.sample_rate,
        };

        for (_, voice) in voices.iter() {
            voice.pre_render();
        }
        for (id, voice) in voices.iter() {
            voice.render(id, &mut buses, &ctx, &self.events);
        }
        let master_gain = renderer.listener.gain;
        renderer.mixer.mix(&mut buses, out, master_gain);
        for (id, voice) in voices.iter() {
            voice.post_render(id, &mut buses, &self.events);
        }
    }
}

fn check_finite(name: &str, value: Vec3) -> Result<()> {
    if !value.is_finite() {
        return Err(PetalSonicError::InvalidValue(format!(
            "{} {} must be finite",
            name, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 4;

    fn context(channels: u16, max_buses: usize) -> PetalSonicContext {
        let _ = env_logger::builder().is_test(true).try_init();
        PetalSonicContext::new(
            PetalSonicContextDesc::new()
                .sample_rate(1000)
                .block_size(BLOCK)
                .channels(channels)
                .max_buses(max_buses)
                .ring_buffer_frames(64)
                .render_strategy(RenderStrategyKind::Interpolating),
        )
        .unwrap()
    }

    fn mono(ctx: &PetalSonicContext, samples: &[f32]) -> BufferId {
        ctx.create_buffer(AudioFormat::mono_f32(1000), SampleData::F32(samples.to_vec()))
            .unwrap()
    }

    fn render(ctx: &PetalSonicContext) -> Vec<f32> {
        let mut out = vec![1.0f32; BLOCK * ctx.desc().channels as usize];
        ctx.render_block(&mut out);
        out
    }

    #[test]
    fn test_invalid_desc_is_rejected() {
        let result = PetalSonicContext::new(PetalSonicContextDesc::new().block_size(0));
        assert!(matches!(result, Err(PetalSonicError::Configuration(_))));
    }

    #[test]
    fn test_buffer_lifecycle() {
        let ctx = context(1, 4);
        let id = mono(&ctx, &[0.0; 6]);
        let info = ctx.buffer_info(id).unwrap();
        assert_eq!(info.total_frames, 6);
        assert_eq!(info.size_in_bytes, 24);
        assert_eq!(info.attachments, 0);

        let voice = ctx.create_voice();
        ctx.queue_buffers(voice, &[id]).unwrap();
        assert_eq!(ctx.buffer_info(id).unwrap().attachments, 1);
        assert!(matches!(
            ctx.delete_buffer(id),
            Err(PetalSonicError::InvalidOperation(_))
        ));

        assert_eq!(ctx.remove_buffers(voice, 0).unwrap(), Vec::new());
        ctx.delete_voice(voice).unwrap();
        ctx.delete_buffer(id).unwrap();
        assert!(matches!(
            ctx.buffer_info(id),
            Err(PetalSonicError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_buffer_from_bytes() {
        let ctx = context(1, 1);
        let bytes: Vec<u8> = [0.5f32, -0.5].iter().flat_map(|s| s.to_le_bytes()).collect();
        let id = ctx
            .create_buffer_from_bytes(AudioFormat::mono_f32(1000), &bytes)
            .unwrap();
        assert_eq!(ctx.buffer_info(id).unwrap().total_frames, 2);
    }

    #[test]
    fn test_unknown_buffer_rejects_whole_queue_call() {
        let ctx = context(1, 4);
        let good = mono(&ctx, &[0.0; 4]);
        let stale = mono(&ctx, &[0.0; 4]);
        ctx.delete_buffer(stale).unwrap();

        let voice = ctx.create_voice();
        assert!(matches!(
            ctx.queue_buffers(voice, &[good, stale]),
            Err(PetalSonicError::InvalidValue(_))
        ));
        assert_eq!(ctx.voice(voice).unwrap().queue_length(), 0);
    }

    #[test]
    fn test_render_block_mixes_voices() {
        let ctx = context(1, 4);
        let a = mono(&ctx, &[0.25; 8]);
        let b = mono(&ctx, &[0.5; 8]);
        let first = ctx.create_voice();
        let second = ctx.create_voice();
        ctx.queue_buffers(first, &[a]).unwrap();
        ctx.queue_buffers(second, &[b]).unwrap();
        ctx.play(first).unwrap();
        ctx.play(second).unwrap();

        assert_eq!(render(&ctx), vec![0.75; BLOCK]);
    }

    #[test]
    fn test_stereo_output_pans_centre() {
        let ctx = context(2, 4);
        let id = mono(&ctx, &[1.0; 8]);
        let voice = ctx.create_voice();
        ctx.queue_buffers(voice, &[id]).unwrap();
        ctx.play(voice).unwrap();

        let out = render(&ctx);
        let centre = std::f32::consts::FRAC_1_SQRT_2;
        for sample in out {
            assert!((sample - centre).abs() < 1e-5);
        }
    }

    #[test]
    fn test_listener_gain_scales_mix() {
        let ctx = context(1, 4);
        let id = mono(&ctx, &[1.0; 8]);
        let voice = ctx.create_voice();
        ctx.queue_buffers(voice, &[id]).unwrap();
        ctx.play(voice).unwrap();
        ctx.set_listener_gain(0.5).unwrap();

        assert_eq!(render(&ctx), vec![0.5; BLOCK]);
    }

    #[test]
    fn test_events_follow_playback() {
        let ctx = context(1, 4);
        let id = mono(&ctx, &[1.0; 6]);
        let voice = ctx.create_voice();
        ctx.queue_buffers(voice, &[id]).unwrap();
        ctx.play(voice).unwrap();
        render(&ctx);
        render(&ctx);

        assert_eq!(
            ctx.poll_events(),
            vec![
                PetalSonicEvent::VoiceStarted { voice_id: voice },
                PetalSonicEvent::VoiceCompleted { voice_id: voice },
            ]
        );
        assert_eq!(ctx.voice(voice).unwrap().state(), VoiceState::Stopped);
    }

    #[test]
    fn test_bus_exhaustion() {
        let ctx = context(1, 1);
        let id = mono(&ctx, &[1.0; 8]);
        let first = ctx.create_voice();
        let second = ctx.create_voice();
        ctx.queue_buffers(first, &[id]).unwrap();
        ctx.queue_buffers(second, &[id]).unwrap();

        ctx.play(first).unwrap();
        assert!(matches!(
            ctx.play(second),
            Err(PetalSonicError::Resource(_))
        ));

        // deleting the first voice frees its bus
        ctx.delete_voice(first).unwrap();
        ctx.play(second).unwrap();
    }

    #[test]
    fn test_deleted_voice_is_unknown() {
        let ctx = context(1, 4);
        let voice = ctx.create_voice();
        assert_eq!(ctx.voice_count(), 1);
        ctx.delete_voice(voice).unwrap();
        assert_eq!(ctx.voice_count(), 0);
        assert!(matches!(
            ctx.play(voice),
            Err(PetalSonicError::InvalidValue(_))
        ));
        assert!(ctx.delete_voice(voice).is_err());
    }

    #[test]
    fn test_pause_and_resume_emit_events() {
        let ctx = context(1, 4);
        let id = mono(&ctx, &[1.0; 32]);
        let voice = ctx.create_voice();
        ctx.queue_buffers(voice, &[id]).unwrap();
        ctx.play(voice).unwrap();
        ctx.pause(voice).unwrap();
        render(&ctx);
        ctx.resume(voice).unwrap();
        ctx.stop(voice).unwrap();
        render(&ctx);

        assert_eq!(
            ctx.poll_events(),
            vec![
                PetalSonicEvent::VoiceStarted { voice_id: voice },
                PetalSonicEvent::VoicePaused { voice_id: voice },
                PetalSonicEvent::VoiceStarted { voice_id: voice },
                PetalSonicEvent::VoiceStopped { voice_id: voice },
            ]
        );
    }

    #[test]
    fn test_auto_strategy_follows_capabilities() {
        let ctx = PetalSonicContext::new(PetalSonicContextDesc::default()).unwrap();
        assert!(ctx.capabilities().resamples_mono_bus);
        assert!(ctx.make_strategy().resamples_in_mixer());
    }

    #[test]
    fn test_listener_and_environment_validation() {
        let ctx = context(2, 1);
        assert!(ctx.set_listener_orientation(Vec3::Y, Vec3::Y).is_err());
        assert!(ctx.set_listener_orientation(Vec3::ZERO, Vec3::Y).is_err());
        ctx.set_listener_orientation(Vec3::X, Vec3::Y).unwrap();
        assert_eq!(ctx.listener().at, Vec3::X);

        assert!(ctx.set_listener_gain(-1.0).is_err());
        assert!(ctx.set_listener_position(Vec3::new(f32::NAN, 0.0, 0.0)).is_err());
        assert!(ctx.set_doppler_factor(-1.0).is_err());
        assert!(ctx.set_speed_of_sound(0.0).is_err());

        ctx.set_distance_model(DistanceModel::Linear);
        assert_eq!(ctx.environment().distance_model, DistanceModel::Linear);
    }
}
