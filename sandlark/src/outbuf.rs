//! Growable byte buffer with a hard ceiling.
//!
//! Every host callback that produces bytes goes through this buffer. The
//! write position may never pass the ceiling; an append that would do so
//! fails before any byte is written and is fatal to the current call.

use std::fmt;

use crate::error::{Resource, SandboxError};

const INITIAL_SIZE: usize = 1024;

#[derive(Debug)]
pub struct OutputBuffer {
    buf: Vec<u8>,
    pos: usize,
    limit: usize,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: vec![0; INITIAL_SIZE.min(limit.max(1))],
            pos: 0,
            limit,
        }
    }

    /// Bytes written so far.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Allocated size; grows by doubling, capped at the limit.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    pub fn clear(&mut self) {
        self.pos = 0;
    }

    /// Copy the written bytes out and reset the buffer.
    pub fn take(&mut self) -> Vec<u8> {
        let out = self.buf[..self.pos].to_vec();
        self.pos = 0;
        out
    }

    /// Append raw bytes, failing without a partial write when the ceiling
    /// would be passed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), SandboxError> {
        let needed = self.pos + bytes.len();
        if needed > self.limit {
            return Err(SandboxError::QuotaExceeded(Resource::Output));
        }
        if needed > self.buf.len() {
            let mut size = self.buf.len().max(1);
            while size < needed {
                size *= 2;
            }
            self.buf.resize(size.min(self.limit), 0);
        }
        self.buf[self.pos..needed].copy_from_slice(bytes);
        self.pos = needed;
        Ok(())
    }

    /// The single formatted-write primitive; callers never format into the
    /// buffer any other way.
    pub fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<(), SandboxError> {
        struct Writer<'a> {
            buf: &'a mut OutputBuffer,
            failed: bool,
        }
        impl fmt::Write for Writer<'_> {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                match self.buf.append(s.as_bytes()) {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        self.failed = true;
                        Err(fmt::Error)
                    }
                }
            }
        }
        let mut writer = Writer {
            buf: self,
            failed: false,
        };
        match fmt::write(&mut writer, args) {
            Ok(()) => Ok(()),
            Err(_) if writer.failed => Err(SandboxError::QuotaExceeded(Resource::Output)),
            Err(_) => Err(SandboxError::ScriptFault("formatting failed".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_doubling_up_to_the_limit() {
        let mut ob = OutputBuffer::new(4096);
        ob.append(&[7u8; 1500]).unwrap();
        assert_eq!(ob.pos(), 1500);
        assert_eq!(ob.size(), 2048);
        ob.append(&[7u8; 2000]).unwrap();
        assert_eq!(ob.pos(), 3500);
        assert_eq!(ob.size(), 4096);
    }

    #[test]
    fn append_past_the_limit_fails_without_a_partial_write() {
        let mut ob = OutputBuffer::new(8);
        ob.append(b"12345").unwrap();
        let err = ob.append(b"6789").unwrap_err();
        assert!(matches!(err, SandboxError::QuotaExceeded(Resource::Output)));
        assert_eq!(ob.pos(), 5);
        assert_eq!(ob.as_slice(), b"12345");
    }

    #[test]
    fn exact_fit_succeeds() {
        let mut ob = OutputBuffer::new(4);
        ob.append(b"abcd").unwrap();
        assert_eq!(ob.pos(), 4);
        assert!(ob.append(b"e").is_err());
    }

    #[test]
    fn write_fmt_reports_overflow() {
        let mut ob = OutputBuffer::new(4);
        ob.write_fmt(format_args!("{}", 42)).unwrap();
        assert_eq!(ob.as_slice(), b"42");
        let err = ob.write_fmt(format_args!("{}", 12345)).unwrap_err();
        assert!(matches!(err, SandboxError::QuotaExceeded(Resource::Output)));
    }

    #[test]
    fn take_copies_and_resets() {
        let mut ob = OutputBuffer::new(64);
        ob.append(b"payload").unwrap();
        assert_eq!(ob.take(), b"payload".to_vec());
        assert_eq!(ob.pos(), 0);
        ob.append(b"x").unwrap();
        assert_eq!(ob.as_slice(), b"x");
    }
}
