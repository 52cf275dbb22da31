/*
Copyright 2026 The hwqueue Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Platform Traits
//!
//! The queue engine never touches hardware directly. Ring memory is accessed
//! through [`MemOps`], DMA memory is obtained from [`DmaOps`], registers are
//! reached through [`Mmio`] and bounded waits are timed by a [`Clock`]. A
//! driver supplies one type implementing all four, which is then usable as a
//! [`Platform`].

use bytemuck::Pod;

use crate::error::{QueueError, Result};

/// Access to DMA-visible memory shared with the device.
///
/// Addresses are host addresses as returned by [`DmaOps::allocate_dma`].
///
/// # Safety
///
/// Implementations must ensure that:
/// - Addresses passed to methods are valid for the duration of the call
/// - `load_acquire`/`store_release` provide the documented ordering
/// - Reads and writes don't cause undefined behavior (alignment, validity)
pub trait MemOps {
    type Error;

    /// Read bytes from DMA memory.
    ///
    /// # Returns
    ///
    /// Number of bytes actually read (should equal `dst.len()` on success).
    fn read(&self, addr: u64, dst: &mut [u8]) -> core::result::Result<usize, Self::Error>;

    /// Write bytes to DMA memory.
    ///
    /// # Returns
    ///
    /// Number of bytes actually written (should equal `src.len()` on success).
    fn write(&self, addr: u64, src: &[u8]) -> core::result::Result<usize, Self::Error>;

    /// Load a u16 with acquire semantics.
    ///
    /// Ownership words are read with this before any other field of an entry.
    fn load_acquire(&self, addr: u64) -> core::result::Result<u16, Self::Error>;

    /// Store a u16 with release semantics.
    ///
    /// Ownership and phase words are published with this after every other
    /// field of an entry.
    fn store_release(&self, addr: u64, val: u16) -> core::result::Result<(), Self::Error>;

    /// Read a Pod type at the given address.
    fn read_val<T: Pod>(&self, addr: u64) -> core::result::Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod type at the given address.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> core::result::Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }
}

/// A block of DMA memory, identified by its host address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    /// Host address of the first byte
    pub addr: u64,
    /// Length in bytes
    pub len: usize,
}

impl DmaRegion {
    /// Address of the byte at `offset`, or `None` past the end of the region.
    pub fn offset(&self, offset: usize) -> Option<u64> {
        if offset >= self.len {
            return None;
        }
        Some(self.addr + offset as u64)
    }

    /// Device-visible address of the region.
    pub fn device_addr<D: DmaOps + ?Sized>(&self, dma: &D) -> u64 {
        dma.to_device_address(self.addr)
    }
}

/// DMA allocation and address translation.
pub trait DmaOps {
    /// Allocate `len` bytes aligned to `align`. Returns `None` when memory is
    /// exhausted.
    fn allocate_dma(&self, len: usize, align: usize) -> Option<DmaRegion>;

    /// Release a region obtained from [`allocate_dma`](Self::allocate_dma).
    fn free_dma(&self, region: DmaRegion);

    /// Translate a host address to the address the device uses for DMA.
    fn to_device_address(&self, host_addr: u64) -> u64;

    /// Translate a device DMA address back to a host address.
    fn to_host_pointer(&self, device_addr: u64) -> u64;
}

/// Memory-mapped register access.
pub trait Mmio {
    /// Read a 32-bit register at `offset` from the register base.
    fn read32(&self, offset: u64) -> u32;

    /// Write a 32-bit register at `offset` from the register base.
    fn write32(&self, offset: u64, value: u32);

    /// Write memory barrier: all prior writes to DMA memory become visible to
    /// the device before any later write.
    fn barrier(&self);
}

/// Millisecond timekeeping for bounded waits.
pub trait Clock {
    /// Busy-wait for `ms` milliseconds.
    fn sleep_ms(&self, ms: u64);

    /// Monotonic millisecond tick count.
    fn ticks_ms(&self) -> u64;
}

/// Everything the engine needs from the surrounding firmware.
pub trait Platform: MemOps + DmaOps + Mmio + Clock {
    /// Allocate zeroed DMA memory.
    fn allocate_zeroed(&self, len: usize, align: usize) -> Result<DmaRegion> {
        let region = self
            .allocate_dma(len, align)
            .ok_or(QueueError::NoMemory)?;
        if let Err(err) = self.fill_zero(region) {
            self.free_dma(region);
            return Err(err);
        }
        Ok(region)
    }

    /// Zero a region of DMA memory.
    fn fill_zero(&self, region: DmaRegion) -> Result<()> {
        const CHUNK: [u8; 64] = [0; 64];
        let mut done = 0;
        while done < region.len {
            let n = core::cmp::min(CHUNK.len(), region.len - done);
            self.write(region.addr + done as u64, &CHUNK[..n])
                .map_err(|_| QueueError::Mem)?;
            done += n;
        }
        Ok(())
    }
}

impl<T: MemOps + DmaOps + Mmio + Clock> Platform for T {}

/// A network buffer handed to the engine for transmit or receive.
pub trait DmaBuffer {
    /// Device-visible address of the data.
    fn device_addr(&self) -> u64;

    /// Length of the data (transmit) or capacity of the buffer (receive).
    fn len(&self) -> u32;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Supplier of fresh receive buffers used to refill receive rings.
pub trait RxSource<B> {
    /// Allocate a buffer able to hold `len` bytes, or `None` when none are
    /// available right now.
    fn alloc_rx(&mut self, len: u32) -> Option<B>;
}

impl<B, F: FnMut(u32) -> Option<B>> RxSource<B> for F {
    fn alloc_rx(&mut self, len: u32) -> Option<B> {
        self(len)
    }
}
