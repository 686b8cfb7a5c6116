use super::pool::{BufferPool, BufferState, TransferBuffer};
use super::{WaveOutDevice, WaveOutDriver};
use crate::error::{OutputError, op_failed};
use crate::format::PlaybackFormat;
use crate::negotiate::SampleFormat;
use std::mem::size_of;
use std::ptr;
use std::sync::Arc;
use tracing::{debug, warn};
use windows_sys::Win32::Media::Audio::{
    CALLBACK_FUNCTION, HWAVEOUT, WAVE_FORMAT_PCM, WAVE_FORMAT_QUERY, WAVE_MAPPER, WAVEFORMATEX,
    WAVEHDR, WOM_DONE, waveOutClose, waveOutGetNumDevs, waveOutOpen, waveOutPrepareHeader,
    waveOutReset, waveOutUnprepareHeader, waveOutWrite,
};
use windows_sys::Win32::Media::MMSYSERR_NOERROR;

fn wave_format(sample: SampleFormat, channels: usize, rate: u32) -> WAVEFORMATEX {
    let bits = sample.bit_depth() as u16;
    let block_align = (bits / 8) * channels as u16;
    WAVEFORMATEX {
        wFormatTag: WAVE_FORMAT_PCM as u16,
        nChannels: channels as u16,
        nSamplesPerSec: rate,
        nAvgBytesPerSec: rate * u32::from(block_align),
        nBlockAlign: block_align,
        wBitsPerSample: bits,
        cbSize: 0,
    }
}

fn device_index(device_id: Option<u32>) -> u32 {
    device_id.unwrap_or(WAVE_MAPPER)
}

fn mm_error(op: &str, code: u32) -> OutputError {
    OutputError::Device(op_failed("waveOut", op, format!("MMRESULT {code}")))
}

/// Runs on a driver thread. Only hands the buffer back to the pool; the
/// header is unprepared later from the writer's side.
unsafe extern "system" fn wave_callback(
    _hwo: HWAVEOUT,
    msg: u32,
    instance: usize,
    param1: usize,
    _param2: usize,
) {
    if msg != WOM_DONE || instance == 0 || param1 == 0 {
        return;
    }
    // SAFETY: `instance` is the pool pointer kept alive by the device, and
    // `dwUser` is the box leaked in `submit`.
    unsafe {
        let header = &*(param1 as *const WAVEHDR);
        let pool = &*(instance as *const BufferPool);
        let buffer = Box::from_raw(header.dwUser as *mut TransferBuffer);
        pool.release(buffer);
    }
}

/// The system waveOut API.
#[derive(Debug, Default, Clone, Copy)]
pub struct WinMmDriver;

impl WaveOutDriver for WinMmDriver {
    type Device = WinMmDevice;

    fn device_count(&self) -> u32 {
        // SAFETY: no arguments.
        unsafe { waveOutGetNumDevs() }
    }

    fn supports(&self, device_id: Option<u32>, sample: SampleFormat, channels: usize, rate: u32) -> bool {
        if sample.encoding().is_companded() || sample.bit_depth() == 24 {
            return false;
        }
        // Unsigned 8-bit and signed 16-bit little-endian are the only PCM layouts.
        if !matches!(sample, SampleFormat::U8 | SampleFormat::S16Le) {
            return false;
        }
        let wfx = wave_format(sample, channels, rate);
        // SAFETY: a format query writes no handle.
        let code = unsafe {
            waveOutOpen(
                ptr::null_mut(),
                device_index(device_id),
                &wfx,
                0,
                0,
                WAVE_FORMAT_QUERY,
            )
        };
        code == MMSYSERR_NOERROR
    }

    fn open(
        &self,
        device_id: Option<u32>,
        format: &PlaybackFormat,
        pool: Arc<BufferPool>,
    ) -> Result<WinMmDevice, OutputError> {
        let sample = SampleFormat::from_encoding(format.encoding);
        let wfx = wave_format(sample, format.channels(), format.rate);
        let mut handle: HWAVEOUT = ptr::null_mut();
        // SAFETY: the callback only dereferences the pool, which the device
        // owns until after `waveOutClose`.
        let code = unsafe {
            waveOutOpen(
                &mut handle,
                device_index(device_id),
                &wfx,
                wave_callback as usize,
                Arc::as_ptr(&pool) as usize,
                CALLBACK_FUNCTION,
            )
        };
        if code != MMSYSERR_NOERROR {
            return Err(mm_error("open", code));
        }
        Ok(WinMmDevice { handle, pool })
    }
}

pub struct WinMmDevice {
    handle: HWAVEOUT,
    pool: Arc<BufferPool>,
}

// The handle is only touched by the owning mode; the callback uses the pool.
unsafe impl Send for WinMmDevice {}

impl WinMmDevice {
    fn unprepare(&self, buffer: &mut TransferBuffer) {
        if !buffer.prepared {
            return;
        }
        // SAFETY: the header was prepared on this handle and is done.
        let code = unsafe {
            waveOutUnprepareHeader(self.handle, &mut buffer.header, size_of::<WAVEHDR>() as u32)
        };
        if code != MMSYSERR_NOERROR {
            debug!("waveOut: unprepare failed with MMRESULT {code}");
        }
        buffer.prepared = false;
    }
}

impl WaveOutDevice for WinMmDevice {
    fn submit(&mut self, mut buffer: Box<TransferBuffer>) -> Result<(), OutputError> {
        self.unprepare(&mut buffer);
        let len = buffer.len() as u32;
        let data = buffer.data_mut_ptr();
        buffer.header = WAVEHDR {
            lpData: data,
            dwBufferLength: len,
            dwBytesRecorded: 0,
            dwUser: 0,
            dwFlags: 0,
            dwLoops: 0,
            lpNext: ptr::null_mut(),
            reserved: 0,
        };
        // SAFETY: header and data live in the box, which stays put until
        // the callback reclaims it.
        let code = unsafe {
            waveOutPrepareHeader(self.handle, &mut buffer.header, size_of::<WAVEHDR>() as u32)
        };
        if code != MMSYSERR_NOERROR {
            self.pool.release(buffer);
            return Err(mm_error("prepare", code));
        }
        buffer.prepared = true;
        buffer.mark_queued();

        let raw = Box::into_raw(buffer);
        // SAFETY: `raw` is a live allocation; ownership passes to the driver.
        let code = unsafe {
            (*raw).header.dwUser = raw as usize;
            waveOutWrite(self.handle, &mut (*raw).header, size_of::<WAVEHDR>() as u32)
        };
        if code != MMSYSERR_NOERROR {
            // SAFETY: the driver rejected the header, so nobody else holds it.
            let mut buffer = unsafe { Box::from_raw(raw) };
            self.unprepare(&mut buffer);
            self.pool.release(buffer);
            return Err(mm_error("write", code));
        }
        Ok(())
    }

    fn reset(&mut self) {
        // SAFETY: valid open handle; completes every queued header.
        let code = unsafe { waveOutReset(self.handle) };
        if code != MMSYSERR_NOERROR {
            warn!("waveOut: reset failed with MMRESULT {code}");
        }
    }
}

impl Drop for WinMmDevice {
    fn drop(&mut self) {
        self.reset();
        self.pool.for_each_free(|buffer| {
            debug_assert_eq!(buffer.state(), BufferState::Free);
            self.unprepare(buffer);
        });
        // SAFETY: every header is back in the pool and unprepared.
        let code = unsafe { waveOutClose(self.handle) };
        if code != MMSYSERR_NOERROR {
            warn!("waveOut: close failed with MMRESULT {code}");
        }
    }
}
