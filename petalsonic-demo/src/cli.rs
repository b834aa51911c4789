use anyhow::{Context, Result};
use petalsonic_stream::math::Vec3;
use petalsonic_stream::{
    AudioFormat, BufferId, PetalSonicContext, PetalSonicContextDesc, PetalSonicEngine,
    PetalSonicEvent, SampleData, VoiceId, VoiceState,
};
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SOURCE_RATE: u32 = 44100;
const CHUNK_FRAMES: usize = SOURCE_RATE as usize / 4;
const QUEUED_CHUNKS: usize = 4;

/// Generates consecutive chunks of a sine tone as 16-bit mono PCM.
struct ToneGenerator {
    frequency: f32,
    phase: f32,
}

impl ToneGenerator {
    fn new(frequency: f32) -> Self {
        Self {
            frequency,
            phase: 0.0,
        }
    }

    fn next_chunk(&mut self) -> Vec<i16> {
        let step = TAU * self.frequency / SOURCE_RATE as f32;
        (0..CHUNK_FRAMES)
            .map(|_| {
                let sample = (self.phase.sin() * 0.3 * i16::MAX as f32) as i16;
                self.phase = (self.phase + step) % TAU;
                sample
            })
            .collect()
    }
}

fn queue_chunk(
    context: &PetalSonicContext,
    voice: VoiceId,
    tone: &mut ToneGenerator,
) -> Result<BufferId> {
    let buffer = context.create_buffer(
        AudioFormat::mono_i16(SOURCE_RATE),
        SampleData::I16(tone.next_chunk()),
    )?;
    context.queue_buffers(voice, &[buffer])?;
    Ok(buffer)
}

fn log_events(context: &PetalSonicContext) {
    for event in context.poll_events() {
        if event.is_error() {
            log::warn!("{:?}", event);
        } else {
            log::info!("{:?}", event);
        }
    }
}

fn start_engine() -> Result<(Arc<PetalSonicContext>, PetalSonicEngine)> {
    let desc = PetalSonicContextDesc::new().sample_rate(48000).block_size(512);
    let context = Arc::new(PetalSonicContext::new(desc)?);
    let mut engine = PetalSonicEngine::new(Arc::clone(&context))?;
    engine.start().context("Failed to start the audio engine")?;
    Ok((context, engine))
}

/// Streams a tone by recycling processed buffers, pausing halfway through.
pub fn run_streaming_demo() -> Result<()> {
    let (context, mut engine) = start_engine()?;
    let voice = context.create_voice();
    let mut tone = ToneGenerator::new(440.0);

    for _ in 0..QUEUED_CHUNKS {
        queue_chunk(&context, voice, &mut tone)?;
    }
    context.play(voice)?;
    log::info!("Streaming a 440 Hz tone");

    let started = Instant::now();
    let mut paused = false;
    while started.elapsed() < Duration::from_secs(6) {
        let handle = context.voice(voice)?;
        let processed = handle.buffers_processed();
        if processed > 0 {
            for buffer in context.remove_buffers(voice, processed)? {
                context.delete_buffer(buffer)?;
                queue_chunk(&context, voice, &mut tone)?;
            }
        }

        if !paused && started.elapsed() > Duration::from_secs(3) {
            log::info!("Pausing for half a second");
            context.pause(voice)?;
            std::thread::sleep(Duration::from_millis(500));
            context.resume(voice)?;
            paused = true;
        }
        if handle.state() == VoiceState::Stopped {
            log::warn!("Voice starved, restarting");
            context.play(voice)?;
        }

        log_events(&context);
        std::thread::sleep(Duration::from_millis(50));
    }

    context.stop(voice)?;
    std::thread::sleep(Duration::from_millis(100));
    context.delete_voice(voice)?;
    engine.stop()?;
    log_events(&context);
    log::info!(
        "Streaming demo finished after {} rendered frames",
        engine.frames_rendered()
    );
    Ok(())
}

/// Loops a short tone around the listener while it approaches and recedes.
pub fn run_orbit_demo() -> Result<()> {
    let (context, mut engine) = start_engine()?;
    let voice = context.create_voice();
    let mut tone = ToneGenerator::new(330.0);
    let buffer = context.create_buffer(
        AudioFormat::mono_i16(SOURCE_RATE),
        SampleData::I16(tone.next_chunk()),
    )?;
    context.set_buffer(voice, Some(buffer))?;

    let handle = context.voice(voice)?;
    handle.set_looping(true);
    handle.set_reference_distance(2.0)?;
    context.play(voice)?;

    let started = Instant::now();
    let mut last_position = Vec3::ZERO;
    let mut last_time = 0.0f32;
    while started.elapsed() < Duration::from_secs(8) {
        let t = started.elapsed().as_secs_f32();
        let radius = 3.0 + 2.0 * (t * 0.5).sin();
        let position = Vec3::new(radius * t.cos(), 0.0, radius * t.sin());
        let dt = (t - last_time).max(f32::EPSILON);
        handle.set_position(position)?;
        handle.set_velocity((position - last_position) / dt)?;
        last_position = position;
        last_time = t;

        for event in context.poll_events() {
            if let PetalSonicEvent::BufferUnderrun { frames } = event {
                log::warn!("Device underrun of {} frames", frames);
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    context.stop(voice)?;
    std::thread::sleep(Duration::from_millis(100));
    context.delete_voice(voice)?;
    context.delete_buffer(buffer)?;
    engine.stop()?;
    log::info!("Orbit demo finished");
    Ok(())
}
