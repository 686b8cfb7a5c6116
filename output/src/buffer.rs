//! In-memory output: PCM lands in a fixed-capacity region the host reads
//! from, and anything that does not fit is spilled into a growable store so
//! nothing is dropped under backpressure.

use crate::error::OutputError;
use crate::mode::{ControlReply, ControlRequest, ModeCore, ModeFlags, OpenStatus, PlayMode};
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, Producer};
use tracing::debug;

pub struct BufferMode {
    core: ModeCore,
    capacity: usize,
    ring: Option<HeapRb<u8>>,
    stored: Vec<u8>,
    /// Bytes ever accepted into the fixed region; the write cursor is this
    /// modulo capacity.
    written: u64,
}

impl BufferMode {
    pub fn new(capacity: usize) -> Self {
        Self {
            core: ModeCore::new('b', "Memory buffer", ModeFlags::PCM_STREAM),
            capacity: capacity.max(1),
            ring: None,
            stored: Vec::new(),
            written: 0,
        }
    }

    /// Bytes waiting to be read, fixed region plus spill store.
    pub fn pending(&self) -> usize {
        self.ring.as_ref().map_or(0, |ring| ring.occupied_len()) + self.stored.len()
    }

    pub fn total_written(&self) -> u64 {
        self.written
    }

    pub fn spilled(&self) -> usize {
        self.stored.len()
    }

    /// Moves pending PCM into `out` in write order.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let Some(ring) = self.ring.as_mut() else {
            return 0;
        };
        let mut copied = 0;
        while copied < out.len() {
            let n = ring.pop_slice(&mut out[copied..]);
            self.written += Self::refill(ring, &mut self.stored) as u64;
            if n == 0 {
                break;
            }
            copied += n;
        }
        copied
    }

    fn refill(ring: &mut HeapRb<u8>, stored: &mut Vec<u8>) -> usize {
        if stored.is_empty() {
            return 0;
        }
        let moved = ring.push_slice(stored);
        stored.drain(..moved);
        moved
    }
}

impl PlayMode for BufferMode {
    fn core(&self) -> &ModeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModeCore {
        &mut self.core
    }

    fn open(&mut self) -> Result<OpenStatus, OutputError> {
        self.ring = Some(HeapRb::new(self.capacity));
        self.stored.clear();
        self.written = 0;
        Ok(OpenStatus::Exact)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, OutputError> {
        let ring = self.ring.as_mut().ok_or(OutputError::NotOpen)?;
        let landed = if self.stored.is_empty() {
            ring.push_slice(buf)
        } else {
            0
        };
        self.written += landed as u64;
        if landed < buf.len() {
            self.stored.extend_from_slice(&buf[landed..]);
            debug!(
                "memory buffer full, spilled {} bytes ({} stored)",
                buf.len() - landed,
                self.stored.len()
            );
        }
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.ring = None;
        self.stored = Vec::new();
    }

    fn control(&mut self, request: ControlRequest) -> Result<ControlReply, OutputError> {
        let frame = self.core.format.frame_bytes().max(1);
        match request {
            ControlRequest::Discard => {
                if let Some(ring) = self.ring.as_mut() {
                    ring.clear();
                }
                self.stored.clear();
                Ok(ControlReply::Done)
            }
            ControlRequest::Flush | ControlRequest::PlayStart(_) | ControlRequest::PlayEnd => {
                Ok(ControlReply::Done)
            }
            ControlRequest::GetQSize => Ok(ControlReply::Bytes(self.capacity)),
            ControlRequest::GetFillable => {
                let free = self.ring.as_ref().map_or(0, |ring| ring.vacant_len());
                let free = if self.stored.is_empty() { free } else { 0 };
                Ok(ControlReply::Frames((free / frame) as u64))
            }
            ControlRequest::GetFilled => Ok(ControlReply::Frames((self.pending() / frame) as u64)),
            _ => Err(OutputError::Unsupported),
        }
    }

    fn is_open(&self) -> bool {
        self.ring.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(capacity: usize) -> BufferMode {
        let mut mode = BufferMode::new(capacity);
        mode.open().unwrap();
        mode
    }

    #[test]
    fn overflow_is_spilled_not_dropped() {
        let mut mode = opened(8);
        let chunks: [&[u8]; 4] = [&[1, 2, 3], &[4, 5, 6, 7, 8, 9], &[10], &[11, 12, 13, 14]];
        let mut expected = Vec::new();
        for chunk in chunks {
            assert_eq!(mode.write(chunk).unwrap(), chunk.len());
            expected.extend_from_slice(chunk);
        }
        assert_eq!(mode.pending(), expected.len());
        assert_eq!(mode.spilled(), expected.len() - 8);

        let mut out = vec![0_u8; 64];
        let n = mode.read(&mut out);
        assert_eq!(&out[..n], expected.as_slice());
        assert_eq!(mode.pending(), 0);
        assert_eq!(mode.total_written(), expected.len() as u64);
    }

    #[test]
    fn interleaved_reads_keep_order() {
        let mut mode = opened(4);
        let mut expected = Vec::new();
        let mut got = Vec::new();
        for i in 0..20_u8 {
            let chunk = [i, i.wrapping_add(100), i.wrapping_add(200)];
            mode.write(&chunk).unwrap();
            expected.extend_from_slice(&chunk);
            if i % 3 == 0 {
                let mut out = [0_u8; 5];
                let n = mode.read(&mut out);
                got.extend_from_slice(&out[..n]);
            }
        }
        let mut out = vec![0_u8; 128];
        let n = mode.read(&mut out);
        got.extend_from_slice(&out[..n]);
        assert_eq!(got, expected);
    }

    #[test]
    fn discard_then_write() {
        let mut mode = opened(4);
        mode.write(&[1; 10]).unwrap();
        assert_eq!(mode.control(ControlRequest::Discard).unwrap(), ControlReply::Done);
        assert_eq!(mode.pending(), 0);
        assert_eq!(mode.total_written(), 4);
        assert_eq!(mode.write(&[2, 3]).unwrap(), 2);
        assert_eq!(mode.total_written(), 6);
        let mut out = [0_u8; 4];
        assert_eq!(mode.read(&mut out), 2);
        assert_eq!(&out[..2], &[2, 3]);
    }

    #[test]
    fn write_before_open_fails() {
        let mut mode = BufferMode::new(4);
        assert!(matches!(mode.write(&[0]), Err(OutputError::NotOpen)));
        mode.close();
        mode.close();
    }

    #[test]
    fn fill_level_queries() {
        let mut mode = opened(16);
        mode.write(&[0; 12]).unwrap();
        assert_eq!(mode.control(ControlRequest::GetFilled).unwrap(), ControlReply::Frames(3));
        assert_eq!(mode.control(ControlRequest::GetFillable).unwrap(), ControlReply::Frames(1));
        assert_eq!(mode.control(ControlRequest::GetQSize).unwrap(), ControlReply::Bytes(16));
        assert!(mode.control(ControlRequest::GetFragSize).unwrap_err().is_unsupported());
    }
}
