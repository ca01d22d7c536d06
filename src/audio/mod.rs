//! # Audio Module
//!
//! Playback core of the jukebox: everything between a resolved track and a
//! stream of paced voice frames.
//!
//! ## Architecture
//!
//! ### [`player`] - Session Registry
//! - One [`session::VoiceSession`] per guild, created on join, removed on leave
//! - Background maintenance (idle disconnect, cache cleanup)
//!
//! ### [`session`] - Voice Session
//! - Engine state machine (`Idle`, `Starting`, `Playing`, `Paused`, `Stopping`)
//! - Single admission point for the next track
//! - Transport failures are fail-stop; pipeline failures skip the track
//!
//! ### [`queue`] - Queue Management
//! - Strict FIFO with loop modes (off / track / queue)
//! - Pagination, shuffle and per-requester removal
//!
//! ### [`pipeline`] - Transcode Pipeline
//! - [`decoder`] on the blocking pool: symphonia demux + decode
//! - [`resampler`]: rubato to 48 kHz stereo
//! - [`encoder`]: Opus (audiopus) or raw s16le frames
//! - Bounded read-ahead between decoder and sender
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz (Discord standard)
//! - **Channels**: Stereo (2 channels)
//! - **Frame**: 20 ms = 960 samples per channel
//! - **Encoding**: Opus at 96kbps (configurable), or 16-bit PCM

pub mod decoder;
pub mod encoder;
pub mod events;
pub mod pipeline;
pub mod player;
pub mod queue;
pub mod resampler;
pub mod session;

use std::time::Duration;

/// Frecuencia de salida (Hz)
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: usize = 2;
/// Muestras por canal en un frame de 20 ms
pub const FRAME_SAMPLES: usize = 960;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
/// Tamaño de un frame PCM s16le estéreo
pub const PCM_FRAME_BYTES: usize = FRAME_SAMPLES * CHANNELS * 2;
