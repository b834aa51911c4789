//! Real-time safe streaming voice playback for 3D audio.
//!
//! Applications register PCM buffers with a [`PetalSonicContext`], queue them
//! on voices and drive playback from any thread. The render side runs once per
//! block, either through [`PetalSonicEngine`] on the default output device or
//! by calling [`PetalSonicContext::render_block`] directly.

pub mod arena;
pub mod audio_data;
pub mod bus;
pub mod command;
pub mod config;
pub mod context;
pub mod converter;
pub mod engine;
pub mod error;
pub mod events;
pub mod math;
pub mod mixer;
pub mod queue;
pub mod ring_buffer;
pub mod spatial;
pub mod voice;

pub use arena::{BufferId, VoiceId};
pub use audio_data::{AudioBuffer, AudioFormat, SampleData, SampleEncoding};
pub use config::{PetalSonicContextDesc, RenderStrategyKind};
pub use context::{BufferSummary, PetalSonicContext};
pub use engine::PetalSonicEngine;
pub use error::{PetalSonicError, RingBufferError};
pub use events::PetalSonicEvent;
pub use ring_buffer::{RingBuffer, RingReader};
pub use spatial::{DistanceModel, ListenerState};
pub use voice::{OffsetUnit, SourceType, Voice, VoiceParams, VoiceState};
