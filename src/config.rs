use crate::error::{Result, SmuxError};
use crate::frame::DEFAULT_ESC;

/// Smallest legal ring-buffer size. Anything below this cannot even hold a
/// channel-switch header next to a useful amount of payload.
pub const MIN_BUFFER_SIZE: usize = 16;

/// Configuration for one end of a smux link.
///
/// The escape byte is a protocol parameter: it must be configured identically
/// on both ends of the link, and it is never negotiated in band. The buffer
/// sizes are purely local tuning.
///
/// # Examples
///
/// ## Using default configuration
///
/// ```rust
/// use smux::Config;
///
/// let config = Config::default();
/// assert_eq!(config.esc, 0x01);
/// assert_eq!(config.write_buffer_size, 4096);
/// ```
///
/// ## Creating custom configuration
///
/// ```rust
/// use smux::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .esc(0x1b)
///     .write_buffer_size(8 * 1024)
///     .read_buffer_size(8 * 1024)
///     .build()
///     .expect("valid configuration");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Escape byte introducing channel-switch headers and literal escapes.
    pub esc: u8,
    /// Capacity of the outbound (encode) ring buffer.
    pub write_buffer_size: usize,
    /// Capacity of the inbound (decode) ring buffer.
    pub read_buffer_size: usize,
    /// Size of the scratch buffer the runtime reads per-channel input into.
    pub receive_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            esc: DEFAULT_ESC,
            write_buffer_size: 4096,
            read_buffer_size: 4096,
            receive_chunk_size: 2048,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_size < MIN_BUFFER_SIZE {
            return Err(SmuxError::Config(format!(
                "write buffer must be at least {MIN_BUFFER_SIZE} bytes"
            )));
        }

        if self.read_buffer_size < MIN_BUFFER_SIZE {
            return Err(SmuxError::Config(format!(
                "read buffer must be at least {MIN_BUFFER_SIZE} bytes"
            )));
        }

        if self.receive_chunk_size == 0 {
            return Err(SmuxError::Config(
                "receive chunk size cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for creating custom [`Config`] instances.
///
/// Starts from the defaults and allows selective overriding; `build()`
/// validates the result.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn esc(mut self, esc: u8) -> Self {
        self.config.esc = esc;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    pub fn receive_chunk_size(mut self, size: usize) -> Self {
        self.config.receive_chunk_size = size;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
