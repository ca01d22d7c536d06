//! # Open Jukebox
//!
//! Per-guild voice playback engine for Discord music bots: resolve a query,
//! queue it, transcode it to 20 ms frames and pace them onto a voice
//! connection.
//!
//! - [`audio`]: sessions, queue, transcode pipeline and notifications
//! - [`sources`]: query resolution (`yt-dlp`, direct URLs, local files)
//! - [`voice`]: paced voice transport
//! - [`cache`]: resolver result cache
//! - [`config`]: environment-driven configuration

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod sources;
pub mod voice;
