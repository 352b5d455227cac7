//! The telemetry channel: a named POSIX message queue with a fixed
//! capacity and message size.
//!
//! The producer creates the queue and writes to it without ever blocking; a
//! full queue is reported as [`ChannelError::Full`] and the reading is simply
//! dropped. The consumer opens the queue read-only and never creates it.
//!
//! Wire format: one reading per message, ASCII decimal with one fractional
//! digit (`"42.5"`), priority 0. Trailing NUL bytes are tolerated on receive.

use std::ffi::CString;

use nix::errno::Errno;
use nix::mqueue::{MQ_OFlag, MqAttr, MqdT, mq_close, mq_getattr, mq_open, mq_receive, mq_send};
use nix::sys::stat::Mode;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_QUEUE_NAME: &str = "/cpuload";
pub const DEFAULT_CAPACITY: usize = 8;
pub const DEFAULT_MESSAGE_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid queue name {0:?}: expected a single component like \"/cpuload\"")]
    InvalidName(String),
    #[error("message of {len} bytes exceeds the {max}-byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("queue is full")]
    Full,
    #[error("undecodable reading {0:?}")]
    Malformed(String),
    #[error("{op} {name}: {source}")]
    Sys {
        op: &'static str,
        name: String,
        #[source]
        source: Errno,
    },
}

/// Name and limits of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub name: String,
    pub capacity: usize,
    pub message_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            capacity: DEFAULT_CAPACITY,
            message_size: DEFAULT_MESSAGE_SIZE,
        }
    }
}

impl ChannelConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    fn c_name(&self) -> Result<CString, ChannelError> {
        let invalid = || ChannelError::InvalidName(self.name.clone());
        let rest = self.name.strip_prefix('/').ok_or_else(invalid)?;
        if rest.is_empty() || rest.contains('/') {
            return Err(invalid());
        }
        CString::new(self.name.as_bytes()).map_err(|_| invalid())
    }

    fn sys(&self, op: &'static str) -> impl FnOnce(Errno) -> ChannelError + '_ {
        move |source| ChannelError::Sys {
            op,
            name: self.name.clone(),
            source,
        }
    }
}

/// Format a utilization value for the wire.
pub fn encode_reading(percent: f64) -> String {
    format!("{:.1}", percent.clamp(0.0, 100.0))
}

/// Parse a wire payload into a whole percentage in `0..=100`.
///
/// The fractional part is truncated and out-of-range values are clamped.
pub fn decode_reading(payload: &[u8]) -> Result<u8, ChannelError> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let text = String::from_utf8_lossy(&payload[..end]);
    let value: f64 = text
        .trim()
        .parse()
        .map_err(|_| ChannelError::Malformed(text.to_string()))?;
    if value.is_nan() {
        return Err(ChannelError::Malformed(text.to_string()));
    }
    Ok(value.trunc().clamp(0.0, 100.0) as u8)
}

/// Producer end: write-only, non-blocking.
#[derive(Debug)]
pub struct ChannelSender {
    mqd: Option<MqdT>,
    max_message: usize,
}

impl ChannelSender {
    /// Create the queue if it does not exist and open it for writing.
    pub fn create(config: &ChannelConfig) -> Result<Self, ChannelError> {
        let name = config.c_name()?;
        let attr = MqAttr::new(0, config.capacity as _, config.message_size as _, 0);
        let oflag =
            MQ_OFlag::O_CREAT | MQ_OFlag::O_WRONLY | MQ_OFlag::O_NONBLOCK | MQ_OFlag::O_CLOEXEC;
        let mqd = mq_open(name.as_c_str(), oflag, Mode::from_bits_truncate(0o666), Some(&attr))
            .map_err(config.sys("mq_open"))?;

        // An existing queue keeps the limits it was created with.
        let actual = mq_getattr(&mqd).map_err(config.sys("mq_getattr"))?;
        debug!(
            name = %config.name,
            capacity = actual.maxmsg(),
            message_size = actual.msgsize(),
            "telemetry channel open for writing"
        );
        Ok(Self {
            max_message: actual.msgsize() as usize,
            mqd: Some(mqd),
        })
    }

    pub fn send(&self, payload: &[u8]) -> Result<(), ChannelError> {
        if payload.len() > self.max_message {
            return Err(ChannelError::TooLarge {
                len: payload.len(),
                max: self.max_message,
            });
        }
        let Some(mqd) = &self.mqd else {
            return Err(ChannelError::Sys {
                op: "mq_send",
                name: String::new(),
                source: Errno::EBADF,
            });
        };
        match mq_send(mqd, payload, 0) {
            Ok(()) => Ok(()),
            Err(Errno::EAGAIN) => Err(ChannelError::Full),
            Err(source) => Err(ChannelError::Sys {
                op: "mq_send",
                name: String::new(),
                source,
            }),
        }
    }
}

impl Drop for ChannelSender {
    fn drop(&mut self) {
        if let Some(mqd) = self.mqd.take() {
            let _ = mq_close(mqd);
        }
    }
}

/// Consumer end: read-only, blocking receive.
#[derive(Debug)]
pub struct ChannelReceiver {
    mqd: Option<MqdT>,
    buf: Vec<u8>,
}

impl ChannelReceiver {
    /// Open an existing queue. `Ok(None)` means nobody has created it yet.
    pub fn open(config: &ChannelConfig) -> Result<Option<Self>, ChannelError> {
        let name = config.c_name()?;
        let oflag = MQ_OFlag::O_RDONLY | MQ_OFlag::O_CLOEXEC;
        let mqd = match mq_open(name.as_c_str(), oflag, Mode::empty(), None) {
            Ok(mqd) => mqd,
            Err(Errno::ENOENT) => return Ok(None),
            Err(e) => return Err(config.sys("mq_open")(e)),
        };
        // Receive buffers must be at least the queue's message size.
        let size = match mq_getattr(&mqd) {
            Ok(attr) => attr.msgsize() as usize,
            Err(e) => {
                let _ = mq_close(mqd);
                return Err(config.sys("mq_getattr")(e));
            }
        };
        debug!(name = %config.name, message_size = size, "telemetry channel open for reading");
        Ok(Some(Self {
            mqd: Some(mqd),
            buf: vec![0; size.max(DEFAULT_MESSAGE_SIZE)],
        }))
    }

    /// Block until a message arrives and return its bytes.
    pub fn receive(&mut self) -> Result<&[u8], Errno> {
        let mqd = self.mqd.as_ref().ok_or(Errno::EBADF)?;
        let mut prio = 0u32;
        let len = mq_receive(mqd, &mut self.buf, &mut prio)?;
        Ok(&self.buf[..len])
    }
}

impl Drop for ChannelReceiver {
    fn drop(&mut self) {
        if let Some(mqd) = self.mqd.take() {
            let _ = mq_close(mqd);
        }
    }
}

/// Remove the queue name. Readers and writers that still have it open keep
/// working until they close.
pub fn unlink(config: &ChannelConfig) -> Result<(), ChannelError> {
    let name = config.c_name()?;
    nix::mqueue::mq_unlink(name.as_c_str()).map_err(config.sys("mq_unlink"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A queue name private to this test process, or `None` when the kernel
    /// does not offer POSIX message queues here.
    pub(crate) fn scratch_queue(tag: &str) -> Option<ChannelConfig> {
        let config = ChannelConfig::named(format!("/jobshell-test-{}-{}", std::process::id(), tag));
        let _ = unlink(&config);
        match ChannelSender::create(&config) {
            Ok(_) => Some(config),
            Err(e) => {
                eprintln!("skipping: POSIX message queues unavailable ({e})");
                None
            }
        }
    }

    #[test]
    fn test_encode_uses_one_fractional_digit() {
        assert_eq!(encode_reading(42.0), "42.0");
        assert_eq!(encode_reading(7.25), "7.2");
        assert_eq!(encode_reading(100.0), "100.0");
        assert_eq!(encode_reading(-3.0), "0.0");
        assert_eq!(encode_reading(180.0), "100.0");
        assert!(encode_reading(100.0).len() <= DEFAULT_MESSAGE_SIZE);
    }

    #[test]
    fn test_decode_truncates_and_clamps() {
        assert_eq!(decode_reading(b"42.9").unwrap(), 42);
        assert_eq!(decode_reading(b"0.0").unwrap(), 0);
        assert_eq!(decode_reading(b"100.0").unwrap(), 100);
        assert_eq!(decode_reading(b"250").unwrap(), 100);
        assert_eq!(decode_reading(b"-12.5").unwrap(), 0);
        assert_eq!(decode_reading(b" 17.0\n").unwrap(), 17);
    }

    #[test]
    fn test_decode_tolerates_trailing_nul() {
        assert_eq!(decode_reading(b"35.5\0\0garbage").unwrap(), 35);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_reading(b"abc"), Err(ChannelError::Malformed(_))));
        assert!(matches!(decode_reading(b""), Err(ChannelError::Malformed(_))));
        assert!(matches!(decode_reading(b"NaN"), Err(ChannelError::Malformed(_))));
    }

    #[test]
    fn test_queue_names_are_validated() {
        for bad in ["cpuload", "/", "/a/b", "/nul\0byte"] {
            let config = ChannelConfig::named(bad);
            assert!(
                matches!(config.c_name(), Err(ChannelError::InvalidName(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(ChannelConfig::default().c_name().is_ok());
    }

    #[test]
    fn test_receiver_does_not_create_queue() {
        let config = ChannelConfig::named(format!("/jobshell-absent-{}", std::process::id()));
        let _ = unlink(&config);
        assert!(ChannelReceiver::open(&config).unwrap().is_none());
        // Still absent afterwards.
        assert!(ChannelReceiver::open(&config).unwrap().is_none());
    }

    #[test]
    fn test_round_trip_and_full_queue() {
        let Some(config) = scratch_queue("full") else {
            return;
        };
        let sender = ChannelSender::create(&config).unwrap();
        let mut receiver = ChannelReceiver::open(&config).unwrap().unwrap();

        for i in 0..config.capacity {
            sender.send(encode_reading(i as f64).as_bytes()).unwrap();
        }
        assert!(matches!(sender.send(b"99.0"), Err(ChannelError::Full)));

        let first = receiver.receive().unwrap().to_vec();
        assert_eq!(first, b"0.0");
        assert!(sender.send(b"99.0").is_ok());

        let oversized = vec![b'1'; config.message_size + 1];
        assert!(matches!(
            sender.send(&oversized),
            Err(ChannelError::TooLarge { .. })
        ));
        unlink(&config).unwrap();
    }
}
