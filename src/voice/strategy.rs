use super::QueueReader;

/// Largest source/output step the interpolating path accepts.
const MAX_INTERPOLATION_RATIO: f64 = 16.0;
/// Read position of the first frame of the next pull.
const FRESH: f64 = 2.0;

/// Output rate and pitch a block is rendered at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateScale {
    pub output_rate: u32,
    /// Pitch times doppler shift
    pub pitch_scale: f64,
}

impl RateScale {
    /// Source frames consumed per output frame for a buffer at `source_rate`.
    pub fn ratio(&self, source_rate: u32) -> f64 {
        source_rate as f64 / self.output_rate as f64 * self.pitch_scale
    }
}

/// Turns queued frames into one bus input block.
pub trait RenderStrategy: Send {
    /// Fills `out[..][..frames]`, zero-padding whatever the queue could not
    /// supply. Returns the number of frames read from the queue.
    fn render(
        &mut self,
        reader: &mut QueueReader,
        out: &mut [Vec<f32>],
        frames: usize,
        scale: RateScale,
    ) -> usize;

    /// Whether the bus must convert rate and pitch itself.
    fn resamples_in_mixer(&self) -> bool;

    /// Whether frames already taken from the queue are still waiting to be
    /// rendered.
    fn holds_frames(&self) -> bool {
        false
    }

    /// Forgets any carried state.
    fn reset(&mut self) {}
}

fn zero_tail(out: &mut [Vec<f32>], from: usize, to: usize) {
    if from < to {
        for plane in out.iter_mut() {
            plane[from..to].fill(0.0);
        }
    }
}

/// Hands frames to the bus unchanged; the mixer applies rate and pitch.
///
/// A buffer with another rate that starts mid-block plays at the bus rate
/// until the block ends.
#[derive(Debug, Default)]
pub struct DirectRender;

impl RenderStrategy for DirectRender {
    fn render(
        &mut self,
        reader: &mut QueueReader,
        out: &mut [Vec<f32>],
        frames: usize,
        _scale: RateScale,
    ) -> usize {
        let mut written = 0;
        while written < frames {
            let count = reader.fill(out, written, frames - written);
            if count == 0 {
                break;
            }
            written += count;
        }
        zero_tail(out, written, frames);
        written
    }

    fn resamples_in_mixer(&self) -> bool {
        true
    }
}

/// Resamples inside the voice with linear interpolation, for mixers that only
/// take output-rate input.
///
/// The two most recently pulled frames sit at the front of the scratch planes
/// and fresh frames follow them, so `read_index` is a position in that joined
/// run. The ratio is re-derived at every sample-rate boundary in the queue.
pub struct InterpolatingRender {
    scratch: Vec<Vec<f32>>,
    read_index: f64,
    /// One past the last scratch index holding pulled audio.
    live_end: isize,
    /// Rate of the frames last pulled, kept for the carry once the queue drains.
    tail_rate: Option<u32>,
    max_pull: usize,
}

impl InterpolatingRender {
    pub fn new(block_size: usize, channels: usize) -> Self {
        // a rate boundary can leave the read position up to one step past the carry
        let max_pull = (block_size as f64 * MAX_INTERPOLATION_RATIO).ceil() as usize
            + MAX_INTERPOLATION_RATIO as usize
            + 2;
        Self {
            scratch: vec![vec![0.0; max_pull + 2]; channels.max(1)],
            read_index: FRESH,
            live_end: 0,
            tail_rate: None,
            max_pull,
        }
    }

    /// Copies straight from the queue while the ratio is one and nothing is
    /// carried. Returns how many frames were written.
    fn copy_through(
        &mut self,
        reader: &mut QueueReader,
        out: &mut [Vec<f32>],
        offset: usize,
        frames: usize,
    ) -> usize {
        let written = reader.fill(out, offset, frames);
        for (plane, rendered) in self.scratch.iter_mut().zip(out.iter()) {
            match written {
                0 => {}
                1 => {
                    plane[0] = plane[1];
                    plane[1] = rendered[offset];
                }
                _ => {
                    plane[0] = rendered[offset + written - 2];
                    plane[1] = rendered[offset + written - 1];
                }
            }
        }
        if written > 0 {
            self.live_end = 2;
        }
        written
    }

    /// Interpolates up to `frames` outputs at one ratio. Returns the outputs
    /// produced and the frames pulled.
    fn interpolate(
        &mut self,
        reader: &mut QueueReader,
        out: &mut [Vec<f32>],
        offset: usize,
        frames: usize,
        ratio: f64,
    ) -> (usize, usize) {
        let channels = out.len().min(self.scratch.len());
        let pull = ((self.read_index + frames as f64 * ratio).floor() as usize).min(self.max_pull);
        let written = reader.fill(&mut self.scratch[..channels], 2, pull);
        if written > 0 {
            self.live_end = 2 + written as isize;
        }

        let (produced, consumed) = if written > 0 && written < pull && !reader.is_drained() {
            // the next buffer runs at another rate; stop where its frames begin
            let reachable = ((written as f64 + 1.0 - self.read_index) / ratio).ceil().max(0.0);
            ((reachable as usize).min(frames), written)
        } else {
            zero_tail(&mut self.scratch[..channels], 2 + written, 2 + pull);
            (frames, pull)
        };

        let limit = consumed + 1;
        for (plane, dest) in self.scratch[..channels].iter().zip(out.iter_mut()) {
            for (i, sample) in dest[offset..offset + produced].iter_mut().enumerate() {
                let position = self.read_index + i as f64 * ratio;
                let index = (position.floor() as usize).min(limit);
                let next = (index + 1).min(limit);
                let fraction = (position - position.floor()) as f32;
                let a = plane[index];
                let b = plane[next];
                *sample = a + (b - a) * fraction;
            }
        }

        for plane in self.scratch[..channels].iter_mut() {
            plane[0] = plane[consumed];
            plane[1] = plane[consumed + 1];
        }
        self.read_index = (self.read_index + produced as f64 * ratio - consumed as f64).max(0.0);
        self.live_end -= consumed as isize;
        (produced, written)
    }
}

impl RenderStrategy for InterpolatingRender {
    fn render(
        &mut self,
        reader: &mut QueueReader,
        out: &mut [Vec<f32>],
        frames: usize,
        scale: RateScale,
    ) -> usize {
        let channels = out.len().min(self.scratch.len());
        let out = &mut out[..channels];
        let mut done = 0;
        let mut read = 0;

        while done < frames {
            let source_rate = reader
                .source_rate()
                .or(self.tail_rate)
                .unwrap_or(scale.output_rate);
            self.tail_rate = Some(source_rate);
            let ratio = scale
                .ratio(source_rate)
                .clamp(1.0 / MAX_INTERPOLATION_RATIO, MAX_INTERPOLATION_RATIO);

            if ratio == 1.0 && self.read_index == FRESH {
                let written = self.copy_through(reader, out, done, frames - done);
                read += written;
                done += written;
                if written == 0 || reader.is_drained() {
                    break;
                }
                continue;
            }

            let (produced, pulled) = self.interpolate(reader, out, done, frames - done, ratio);
            read += pulled;
            done += produced;
        }

        zero_tail(out, done, frames);
        read
    }

    fn resamples_in_mixer(&self) -> bool {
        false
    }

    fn holds_frames(&self) -> bool {
        self.live_end as f64 - 1.0 >= self.read_index
    }

    fn reset(&mut self) {
        self.read_index = FRESH;
        self.live_end = 0;
        self.tail_rate = None;
        for plane in self.scratch.iter_mut() {
            plane[0] = 0.0;
            plane[1] = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Arena, BufferId};
    use crate::audio_data::{AudioBuffer, AudioFormat, SampleData};
    use crate::queue::BufferInfo;
    use std::sync::Arc;

    const RATE: u32 = 48000;

    fn at_pitch(pitch_scale: f64) -> RateScale {
        RateScale {
            output_rate: RATE,
            pitch_scale,
        }
    }

    fn reader_with(buffers: &[(u32, Vec<f32>)]) -> QueueReader {
        let mut ids: Arena<BufferId, ()> = Arena::new();
        let mut reader = QueueReader::new();
        for (rate, data) in buffers {
            let buffer = AudioBuffer::new(AudioFormat::mono_f32(*rate), SampleData::F32(data.clone()))
                .unwrap();
            reader
                .queue
                .append_buffer(BufferInfo::new(ids.insert(()), Arc::new(buffer), None));
        }
        reader
    }

    fn ramp_reader(frames: usize) -> QueueReader {
        reader_with(&[(RATE, (0..frames).map(|i| i as f32).collect())])
    }

    #[test]
    fn test_direct_render_zero_pads_when_drained() {
        let mut reader = ramp_reader(3);
        let mut out = vec![vec![9.0f32; 5]];
        let written = DirectRender.render(&mut reader, &mut out, 5, at_pitch(1.0));
        assert_eq!(written, 3);
        assert_eq!(out[0], vec![0.0, 1.0, 2.0, 0.0, 0.0]);
        assert!(reader.is_drained());
    }

    #[test]
    fn test_direct_render_crosses_rate_boundaries() {
        let mut reader = reader_with(&[(RATE, vec![1.0, 2.0]), (RATE / 2, vec![3.0, 4.0])]);
        let mut out = vec![vec![0.0f32; 4]];
        assert_eq!(DirectRender.render(&mut reader, &mut out, 4, at_pitch(1.0)), 4);
        assert_eq!(out[0], vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_interpolating_at_unity_matches_direct() {
        let mut direct_reader = ramp_reader(64);
        let mut interp_reader = ramp_reader(64);
        let mut interp = InterpolatingRender::new(16, 1);

        for _ in 0..3 {
            let mut a = vec![vec![0.0f32; 16]];
            let mut b = vec![vec![0.0f32; 16]];
            DirectRender.render(&mut direct_reader, &mut a, 16, at_pitch(1.0));
            interp.render(&mut interp_reader, &mut b, 16, at_pitch(1.0));
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_interpolating_ratio_two_decimates() {
        let mut reader = ramp_reader(64);
        let mut interp = InterpolatingRender::new(4, 1);

        let mut out = vec![vec![0.0f32; 4]];
        assert_eq!(interp.render(&mut reader, &mut out, 4, at_pitch(2.0)), 10);
        assert_eq!(out[0], vec![0.0, 2.0, 4.0, 6.0]);

        assert_eq!(interp.render(&mut reader, &mut out, 4, at_pitch(2.0)), 8);
        assert_eq!(out[0], vec![8.0, 10.0, 12.0, 14.0]);
    }

    #[test]
    fn test_interpolating_half_ratio_blends_neighbours() {
        let mut reader = ramp_reader(64);
        let mut interp = InterpolatingRender::new(4, 1);

        let mut out = vec![vec![0.0f32; 4]];
        assert_eq!(interp.render(&mut reader, &mut out, 4, at_pitch(0.5)), 4);
        assert_eq!(out[0], vec![0.0, 0.5, 1.0, 1.5]);
        assert_eq!(interp.render(&mut reader, &mut out, 4, at_pitch(0.5)), 2);
        assert_eq!(out[0], vec![2.0, 2.5, 3.0, 3.5]);
    }

    #[test]
    fn test_interpolating_plays_carried_frames_after_drain() {
        let mut reader = ramp_reader(10);
        let mut interp = InterpolatingRender::new(4, 1);

        let mut out = vec![vec![0.0f32; 4]];
        interp.render(&mut reader, &mut out, 4, at_pitch(2.0));
        assert_eq!(out[0], vec![0.0, 2.0, 4.0, 6.0]);
        assert!(!reader.is_drained());
        assert!(interp.holds_frames());

        interp.render(&mut reader, &mut out, 4, at_pitch(2.0));
        assert_eq!(out[0], vec![8.0, 0.0, 0.0, 0.0]);
        assert!(reader.is_drained());
        assert!(!interp.holds_frames());
    }

    #[test]
    fn test_interpolating_follows_rate_of_each_buffer() {
        let mut reader = reader_with(&[
            (RATE, vec![1.0, 2.0]),
            (RATE / 2, vec![10.0, 20.0, 30.0, 40.0]),
        ]);
        let mut interp = InterpolatingRender::new(4, 1);
        let mut out = vec![vec![0.0f32; 4]];

        interp.render(&mut reader, &mut out, 4, at_pitch(1.0));
        assert_eq!(out[0], vec![1.0, 2.0, 10.0, 15.0]);
        interp.render(&mut reader, &mut out, 4, at_pitch(1.0));
        assert_eq!(out[0], vec![20.0, 25.0, 30.0, 35.0]);
        assert!(reader.is_drained());
        assert!(interp.holds_frames());

        interp.render(&mut reader, &mut out, 4, at_pitch(1.0));
        assert_eq!(out[0], vec![40.0, 20.0, 0.0, 0.0]);
        assert!(!interp.holds_frames());
    }

    #[test]
    fn test_reset_starts_on_next_frame() {
        let mut reader = ramp_reader(64);
        let mut interp = InterpolatingRender::new(4, 1);
        let mut out = vec![vec![0.0f32; 4]];
        interp.render(&mut reader, &mut out, 4, at_pitch(1.5));

        interp.reset();
        assert!(!interp.holds_frames());
        interp.render(&mut reader, &mut out, 4, at_pitch(1.0));
        assert_eq!(out[0], vec![8.0, 9.0, 10.0, 11.0]);
    }
}
