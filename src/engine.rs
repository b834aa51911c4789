//! Device output for a [`PetalSonicContext`].
//!
//! A render thread runs the context block by block and stores the result in a
//! [`RingBuffer`] at increasing sample times. The `cpal` output callback only
//! fetches from the ring at its own read time, so the device thread never
//! touches a voice, a bus or a lock.

use crate::context::PetalSonicContext;
use crate::error::{PetalSonicError, Result};
use crate::events::{EventSink, PetalSonicEvent};
use crate::ring_buffer::{RingBuffer, RingReader};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Blocks rendered before the device stream starts.
const PRE_ROLL_BLOCKS: usize = 2;

/// Audio engine that feeds the default output device from a context
pub struct PetalSonicEngine {
    context: Arc<PetalSonicContext>,
    stream: Option<cpal::Stream>,
    render_thread: Option<JoinHandle<()>>,
    is_running: Arc<AtomicBool>,
    read_position: Arc<AtomicI64>,
    frames_rendered: Arc<AtomicUsize>,
}

/// Everything the device callback needs, moved into it.
struct DeviceFeed {
    reader: RingReader,
    planes: Vec<Vec<f32>>,
    read_position: Arc<AtomicI64>,
    is_running: Arc<AtomicBool>,
    events: EventSink,
}

impl DeviceFeed {
    /// Fills `data` from the ring. Anything not yet rendered plays as silence.
    fn fill<T>(&mut self, data: &mut [T])
    where
        T: SizedSample + FromSample<f32>,
    {
        if !self.is_running.load(Ordering::Relaxed) {
            data.fill(T::from_sample(0.0f32));
            return;
        }

        let channels = self.planes.len();
        let frames = data.len() / channels;
        let available = frames.min(self.reader.capacity());
        let start = self.read_position.load(Ordering::Acquire);

        if let Err(e) = self.reader.fetch(&mut self.planes, available, start) {
            log::trace!("Ring fetch at {} failed: {}", start, e);
            self.events.emit(PetalSonicEvent::BufferUnderrun { frames: available });
        }

        for (frame, out) in data.chunks_exact_mut(channels).enumerate() {
            for (channel, sample) in out.iter_mut().enumerate() {
                let value = if frame < available {
                    self.planes[channel][frame]
                } else {
                    0.0
                };
                *sample = T::from_sample(value);
            }
        }
        self.read_position.fetch_add(frames as i64, Ordering::Release);
    }
}

/// Render-thread side: renders blocks and keeps the ring topped up.
struct RenderLoop {
    context: Arc<PetalSonicContext>,
    ring: RingBuffer,
    interleaved: Vec<f32>,
    planes: Vec<Vec<f32>>,
    write_position: i64,
    read_position: Arc<AtomicI64>,
    frames_rendered: Arc<AtomicUsize>,
}

impl RenderLoop {
    fn block_size(&self) -> usize {
        self.planes.first().map_or(0, Vec::len)
    }

    /// Whether one more block fits without running more than
    /// `capacity - block_size` frames ahead of the device.
    fn has_room(&self) -> bool {
        let block = self.block_size() as i64;
        let ahead = self.write_position - self.read_position.load(Ordering::Acquire);
        ahead + block <= self.ring.capacity() as i64 - block
    }

    fn render_one(&mut self) {
        let read = self.read_position.load(Ordering::Acquire);
        if self.write_position < read {
            log::warn!(
                "Render thread fell {} frames behind the device",
                read - self.write_position
            );
            self.write_position = read;
        }

        self.context.render_block(&mut self.interleaved);
        let channels = self.planes.len();
        for (channel, plane) in self.planes.iter_mut().enumerate() {
            for (frame, sample) in plane.iter_mut().enumerate() {
                *sample = self.interleaved[frame * channels + channel];
            }
        }

        let block = self.block_size();
        if let Err(e) = self.ring.store(&self.planes, block, self.write_position) {
            log::error!("Failed to store rendered block: {}", e);
            return;
        }
        self.write_position += block as i64;
        self.frames_rendered.fetch_add(block, Ordering::Relaxed);
    }

    fn run(mut self, is_running: Arc<AtomicBool>, idle: Duration) {
        while is_running.load(Ordering::Acquire) {
            if self.has_room() {
                self.render_one();
            } else {
                std::thread::sleep(idle);
            }
        }
        log::debug!("Render thread exiting after {} frames", self.write_position);
    }
}

impl PetalSonicEngine {
    pub fn new(context: Arc<PetalSonicContext>) -> Result<Self> {
        Ok(Self {
            context,
            stream: None,
            render_thread: None,
            is_running: Arc::new(AtomicBool::new(false)),
            read_position: Arc::new(AtomicI64::new(0)),
            frames_rendered: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn context(&self) -> &Arc<PetalSonicContext> {
        &self.context
    }

    /// Starts the render thread and the device stream.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let desc = self.context.desc().clone();
        let channels = desc.channels as usize;

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            PetalSonicError::AudioDevice("No default output device available".into())
        })?;
        let config = cpal::StreamConfig {
            channels: desc.channels,
            sample_rate: cpal::SampleRate(desc.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(desc.block_size as u32),
        };
        let default_config = device.default_output_config().map_err(|e| {
            PetalSonicError::AudioDevice(format!("Failed to get default config: {}", e))
        })?;

        let ring = RingBuffer::new(channels, desc.ring_buffer_frames);
        self.read_position.store(0, Ordering::Release);
        let mut render_loop = RenderLoop {
            context: Arc::clone(&self.context),
            interleaved: vec![0.0; desc.block_size * channels],
            planes: vec![vec![0.0; desc.block_size]; channels],
            write_position: 0,
            read_position: Arc::clone(&self.read_position),
            frames_rendered: Arc::clone(&self.frames_rendered),
            ring,
        };

        let feed = DeviceFeed {
            reader: render_loop.ring.reader(),
            planes: vec![vec![0.0; render_loop.ring.capacity()]; channels],
            read_position: Arc::clone(&self.read_position),
            is_running: Arc::clone(&self.is_running),
            events: self.context.event_sink(),
        };
        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => Self::create_stream::<f32>(&device, &config, feed)?,
            cpal::SampleFormat::I16 => Self::create_stream::<i16>(&device, &config, feed)?,
            cpal::SampleFormat::U16 => Self::create_stream::<u16>(&device, &config, feed)?,
            _ => {
                return Err(PetalSonicError::AudioFormat(
                    "Unsupported sample format".into(),
                ));
            }
        };

        self.context.set_render_active(true);
        for _ in 0..PRE_ROLL_BLOCKS {
            if render_loop.has_room() {
                render_loop.render_one();
            }
        }

        self.is_running.store(true, Ordering::Release);
        let is_running = Arc::clone(&self.is_running);
        let idle = Duration::from_secs_f64(desc.block_size as f64 / desc.sample_rate as f64 / 4.0);
        let render_thread = std::thread::Builder::new()
            .name("petalsonic-render".into())
            .spawn(move || render_loop.run(is_running, idle))
            .map_err(|e| {
                self.is_running.store(false, Ordering::Release);
                self.context.set_render_active(false);
                PetalSonicError::Engine(format!("Failed to spawn render thread: {}", e))
            })?;
        self.render_thread = Some(render_thread);

        if let Err(e) = stream.play() {
            let _ = self.stop();
            return Err(PetalSonicError::AudioDevice(format!(
                "Failed to start stream: {}",
                e
            )));
        }
        self.stream = Some(stream);

        log::info!(
            "Engine started: {} Hz, {} channels, {} frames per block",
            desc.sample_rate,
            desc.channels,
            desc.block_size
        );
        self.context.event_sink().emit(PetalSonicEvent::EngineStarted);
        Ok(())
    }

    /// Stops the device stream and joins the render thread.
    pub fn stop(&mut self) -> Result<()> {
        let was_running = self.is_running.swap(false, Ordering::AcqRel);
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }
        if let Some(handle) = self.render_thread.take() {
            handle
                .join()
                .map_err(|_| PetalSonicError::Engine("Render thread panicked".into()))?;
        }
        self.context.set_render_active(false);

        if was_running {
            log::info!("Engine stopped");
            self.context.event_sink().emit(PetalSonicEvent::EngineStopped);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Frames the render thread has produced since the engine was created.
    pub fn frames_rendered(&self) -> usize {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    fn create_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        mut feed: DeviceFeed,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let events = feed.events.clone();
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| feed.fill(data),
                move |err| {
                    log::error!("Audio stream error: {}", err);
                    events.emit(PetalSonicEvent::EngineError {
                        error: err.to_string(),
                    });
                },
                None,
            )
            .map_err(|e| PetalSonicError::AudioDevice(format!("Failed to build stream: {}", e)))
    }
}

impl Drop for PetalSonicEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::{AudioFormat, SampleData};
    use crate::config::{PetalSonicContextDesc, RenderStrategyKind};

    fn render_loop(ring_frames: usize) -> (RenderLoop, RingReader, Arc<PetalSonicContext>) {
        let context = Arc::new(
            PetalSonicContext::new(
                PetalSonicContextDesc::new()
                    .sample_rate(1000)
                    .block_size(4)
                    .channels(2)
                    .ring_buffer_frames(ring_frames)
                    .render_strategy(RenderStrategyKind::Interpolating),
            )
            .unwrap(),
        );
        let ring = RingBuffer::new(2, ring_frames);
        let reader = ring.reader();
        let render_loop = RenderLoop {
            context: Arc::clone(&context),
            ring,
            interleaved: vec![0.0; 8],
            planes: vec![vec![0.0; 4]; 2],
            write_position: 0,
            read_position: Arc::new(AtomicI64::new(0)),
            frames_rendered: Arc::new(AtomicUsize::new(0)),
        };
        (render_loop, reader, context)
    }

    #[test]
    fn test_render_loop_stays_within_ring() {
        let (mut render_loop, reader, _context) = render_loop(16);
        let mut blocks = 0;
        while render_loop.has_room() {
            render_loop.render_one();
            blocks += 1;
        }
        // capacity 16 with 4-frame blocks leaves room for three blocks
        assert_eq!(blocks, 3);
        assert_eq!(reader.time_bounds().unwrap(), (0, 12));

        render_loop.read_position.store(4, Ordering::Release);
        assert!(render_loop.has_room());
    }

    #[test]
    fn test_render_loop_deinterleaves_into_ring() {
        let (mut render_loop, reader, context) = render_loop(16);
        let id = context
            .create_buffer(AudioFormat::mono_f32(1000), SampleData::F32(vec![1.0; 8]))
            .unwrap();
        let voice = context.create_voice();
        context.queue_buffers(voice, &[id]).unwrap();
        context.play(voice).unwrap();

        render_loop.render_one();
        let mut out = vec![vec![0.0f32; 4]; 2];
        reader.fetch(&mut out, 4, 0).unwrap();
        let centre = std::f32::consts::FRAC_1_SQRT_2;
        assert!(out[0].iter().all(|s| (s - centre).abs() < 1e-5));
        assert!(out[1].iter().all(|s| (s - centre).abs() < 1e-5));
    }

    #[test]
    fn test_render_loop_catches_up_after_underrun() {
        let (mut render_loop, reader, _context) = render_loop(16);
        render_loop.read_position.store(20, Ordering::Release);
        render_loop.render_one();
        assert_eq!(render_loop.write_position, 24);
        assert_eq!(reader.time_bounds().unwrap().1, 24);
    }

    #[test]
    fn test_device_feed_reports_underrun() {
        let (mut render_loop, reader, context) = render_loop(16);
        render_loop.render_one();
        let mut feed = DeviceFeed {
            reader,
            planes: vec![vec![0.0; 16]; 2],
            read_position: Arc::new(AtomicI64::new(0)),
            is_running: Arc::new(AtomicBool::new(true)),
            events: context.event_sink(),
        };

        let mut data = vec![1.0f32; 8];
        feed.fill(&mut data);
        assert!(context.poll_events().is_empty());

        feed.fill(&mut data);
        assert_eq!(data, vec![0.0; 8]);
        assert_eq!(
            context.poll_events(),
            vec![PetalSonicEvent::BufferUnderrun { frames: 4 }]
        );
        assert_eq!(feed.read_position.load(Ordering::Acquire), 8);
    }
}
