pub mod codec;
pub mod config;
pub mod error;
pub mod file;
pub mod frame;
mod ring;
pub mod runtime;

pub use codec::Codec;
pub use config::{Config, ConfigBuilder, MIN_BUFFER_SIZE};
pub use error::{Result, SmuxError};
pub use file::{FdFile, File, Interest};
pub use frame::{
    ChannelId, FrameHeader, DEFAULT_CHANNEL, DEFAULT_ESC, HEADER_SIZE, MAX_FRAME_PAYLOAD,
};
pub use runtime::{Runtime, ShutdownHandle};
