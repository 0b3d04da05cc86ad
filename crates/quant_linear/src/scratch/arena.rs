use byteorder::{ByteOrder, LittleEndian};
use half::f16;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::ScratchAllocator;
use crate::error::{LinearError, Result};

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

fn lock_buffer(buffer: &SharedBuffer) -> candle_core::Result<MutexGuard<'_, Vec<u8>>> {
    match buffer.lock() {
        Ok(guard) => Ok(guard),
        Err(_) => candle_core::bail!("scratch arena lock poisoned"),
    }
}

/// Sized, non-owning view into a device scratch arena.
///
/// The bytes behind a slice are shared with every other slice handed out at
/// the same offset in later allocation passes; contents only live for the
/// duration of one kernel call.
#[derive(Debug, Clone)]
pub struct ScratchSlice {
    buffer: SharedBuffer,
    offset: usize,
    len: usize,
    device_idx: usize,
}

impl ScratchSlice {
    /// Slice over a private buffer (no arena), for allocators that do not pool.
    pub fn standalone(device_idx: usize, len: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(vec![0u8; len])),
            offset: 0,
            len,
            device_idx,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn device_idx(&self) -> usize {
        self.device_idx
    }

    fn check_fits(&self, count: usize) -> candle_core::Result<usize> {
        let bytes = count.saturating_mul(2);
        if bytes > self.len {
            candle_core::bail!(
                "scratch slice too small: need {} bytes, have {}",
                bytes,
                self.len
            );
        }
        Ok(bytes)
    }

    /// Stores `values` as little-endian f16 at the start of the slice.
    pub fn write_f16(&self, values: &[f32]) -> candle_core::Result<()> {
        let bytes = self.check_fits(values.len())?;
        let mut buf = lock_buffer(&self.buffer)?;
        encode_f16(values, &mut buf[self.offset..self.offset + bytes]);
        Ok(())
    }

    /// Reads `count` f16 values back as f32.
    pub fn read_f16(&self, count: usize) -> candle_core::Result<Vec<f32>> {
        let bytes = self.check_fits(count)?;
        let buf = lock_buffer(&self.buffer)?;
        Ok(decode_f16(&buf[self.offset..self.offset + bytes]))
    }

    /// Round-trips `values` through the slice as f16 and runs `f` on the result.
    ///
    /// The arena stays locked until `f` returns: slices of other layers may
    /// cover the same bytes.
    pub fn with_f16<R, F>(&self, values: &[f32], f: F) -> candle_core::Result<R>
    where
        F: FnOnce(Vec<f32>) -> candle_core::Result<R>,
    {
        let bytes = self.check_fits(values.len())?;
        let mut buf = lock_buffer(&self.buffer)?;
        let region = &mut buf[self.offset..self.offset + bytes];
        encode_f16(values, region);
        let decoded = decode_f16(region);
        f(decoded)
    }
}

fn encode_f16(values: &[f32], dst: &mut [u8]) {
    let bits: Vec<u16> = values.iter().map(|&v| f16::from_f32(v).to_bits()).collect();
    LittleEndian::write_u16_into(&bits, dst);
}

fn decode_f16(src: &[u8]) -> Vec<f32> {
    let mut bits = vec![0u16; src.len() / 2];
    LittleEndian::read_u16_into(src, &mut bits);
    bits.into_iter().map(|b| f16::from_bits(b).to_f32()).collect()
}

struct DeviceArena {
    buffer: SharedBuffer,
    capacity: usize,
    cursor: usize,
    passes: usize,
}

/// Per-device scratch arenas, reserved once at model load and sliced per layer.
#[derive(Default)]
pub struct ScratchPool {
    arenas: Mutex<HashMap<usize, DeviceArena>>,
}

impl ScratchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arena size that fits the largest footprint among `footprints`.
    pub fn required_bytes<I: IntoIterator<Item = usize>>(footprints: I) -> usize {
        footprints.into_iter().max().unwrap_or(0)
    }

    /// Allocates (or replaces) the arena for `device_idx`.
    pub fn reserve(&self, device_idx: usize, capacity: usize) -> Result<()> {
        let mut arenas = self.lock()?;
        debug!(device_idx, capacity, "reserving scratch arena");
        arenas.insert(
            device_idx,
            DeviceArena {
                buffer: Arc::new(Mutex::new(vec![0u8; capacity])),
                capacity,
                cursor: 0,
                passes: 0,
            },
        );
        Ok(())
    }

    pub fn capacity(&self, device_idx: usize) -> Option<usize> {
        self.lock().ok()?.get(&device_idx).map(|a| a.capacity)
    }

    /// Number of allocation passes begun on the device.
    pub fn allocation_passes(&self, device_idx: usize) -> usize {
        self.lock()
            .ok()
            .and_then(|arenas| arenas.get(&device_idx).map(|a| a.passes))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<usize, DeviceArena>>> {
        self.arenas
            .lock()
            .map_err(|_| LinearError::Poisoned("scratch pool"))
    }
}

impl ScratchAllocator for ScratchPool {
    fn begin_allocation_pass(&self, device_idx: usize) -> Result<()> {
        let mut arenas = self.lock()?;
        let arena = arenas
            .get_mut(&device_idx)
            .ok_or(LinearError::ScratchUnavailable { device: device_idx })?;
        arena.cursor = 0;
        arena.passes += 1;
        debug!(device_idx, pass = arena.passes, "scratch allocation pass");
        Ok(())
    }

    fn get_slice(&self, device_idx: usize, size_bytes: usize) -> Result<ScratchSlice> {
        let mut arenas = self.lock()?;
        let arena = arenas
            .get_mut(&device_idx)
            .ok_or(LinearError::ScratchUnavailable { device: device_idx })?;
        let available = arena.capacity - arena.cursor;
        if size_bytes > available {
            return Err(LinearError::ScratchExhausted {
                requested: size_bytes,
                available,
            });
        }
        let slice = ScratchSlice {
            buffer: arena.buffer.clone(),
            offset: arena.cursor,
            len: size_bytes,
            device_idx,
        };
        arena.cursor += size_bytes;
        Ok(slice)
    }
}
