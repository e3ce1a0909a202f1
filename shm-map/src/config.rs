use core::fmt;
use core::str::FromStr;
use std::time::Duration;

/// Initial arena size when none is given.
pub const DEFAULT_INITIAL_SIZE: u64 = 5 << 20;
/// Maximum arena size when none is given.
pub const DEFAULT_MAX_SIZE: u64 = 5000 << 20;
/// Buckets of a new table, spread over all shards.
pub const DEFAULT_BUCKET_COUNT: u64 = 1024;
/// No arena is created, or shrunk, below this size.
pub const MINIMUM_SIZE: u64 = 10 << 10;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// How a session uses the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    ReadWrite,
    ReadOnly,
    /// Read and write as the only session that has the arena mapped.
    WriteOnly,
}

impl Mode {
    pub fn is_writable(self) -> bool {
        !matches!(self, Mode::ReadOnly)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::ReadWrite => "rw",
            Mode::ReadOnly => "ro",
            Mode::WriteOnly => "wo",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown mode `{0}`, expected one of `rw`, `ro`, `wo`")]
pub struct ParseModeError(String);

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rw" => Ok(Mode::ReadWrite),
            "ro" => Ok(Mode::ReadOnly),
            "wo" => Ok(Mode::WriteOnly),
            other => Err(ParseModeError(other.to_owned())),
        }
    }
}

/// Sizing and timing of a session.
///
/// Zero sizes stand for the defaults, see [`Options::normalized`].
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// Size of a newly created arena file, in bytes.
    pub initial_size: u64,
    /// The arena never grows beyond this, in bytes.
    pub max_size: u64,
    /// Bucket count of a newly created table.
    pub bucket_count: u64,
    /// How long to wait for the lock block at open before healing it.
    pub lock_timeout: Duration,
}

impl Options {
    pub fn new() -> Self {
        Options {
            initial_size: DEFAULT_INITIAL_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            bucket_count: DEFAULT_BUCKET_COUNT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn initial_size(mut self, bytes: u64) -> Self {
        self.initial_size = bytes;
        self
    }

    pub fn initial_size_kb(self, kb: u64) -> Self {
        self.initial_size(kb.saturating_mul(1024))
    }

    pub fn max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }

    pub fn max_size_kb(self, kb: u64) -> Self {
        self.max_size(kb.saturating_mul(1024))
    }

    pub fn bucket_count(mut self, buckets: u64) -> Self {
        self.bucket_count = buckets;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Replace zeros by defaults and enforce the size floor.
    pub fn normalized(&self) -> Options {
        let mut initial_size = match self.initial_size {
            0 => DEFAULT_INITIAL_SIZE,
            size => size,
        };
        initial_size = initial_size.max(MINIMUM_SIZE);

        let max_size = match self.max_size {
            0 => DEFAULT_MAX_SIZE,
            size => size,
        };

        let bucket_count = match self.bucket_count {
            0 => DEFAULT_BUCKET_COUNT,
            buckets => buckets,
        };

        Options {
            initial_size,
            max_size: max_size.max(initial_size),
            bucket_count,
            lock_timeout: self.lock_timeout,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse() {
        assert_eq!("rw".parse::<Mode>().unwrap(), Mode::ReadWrite);
        assert_eq!("ro".parse::<Mode>().unwrap(), Mode::ReadOnly);
        assert_eq!("wo".parse::<Mode>().unwrap(), Mode::WriteOnly);
        assert!("r+".parse::<Mode>().is_err());

        for mode in [Mode::ReadWrite, Mode::ReadOnly, Mode::WriteOnly] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
    }

    #[test]
    fn zeros_fall_back_to_defaults() {
        let options = Options::new()
            .initial_size(0)
            .max_size(0)
            .bucket_count(0)
            .normalized();

        assert_eq!(options.initial_size, DEFAULT_INITIAL_SIZE);
        assert_eq!(options.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(options.bucket_count, DEFAULT_BUCKET_COUNT);
    }

    #[test]
    fn sizes_respect_the_floor() {
        let options = Options::new().initial_size(1).max_size(2).normalized();
        assert_eq!(options.initial_size, MINIMUM_SIZE);
        assert_eq!(options.max_size, MINIMUM_SIZE);

        let options = Options::new().initial_size_kb(64).max_size_kb(32).normalized();
        assert_eq!(options.initial_size, 64 << 10);
        assert_eq!(options.max_size, 64 << 10);
    }
}
