//! Guest memory access.
//!
//! The interpreter reaches memory exclusively through [`GuestMem`]. The
//! trait separates relaxed accesses, TSO (acquire/release) accesses, and
//! sequentially consistent atomics so a backing implementation can map
//! them onto real host atomics. [`VecMem`] is the flat single-threaded
//! bus used by tests; [`SharedMem`] wraps a buffer in a mutex, giving
//! every access sequential consistency for cross-thread tests.

use oxbow_types::FenceKind;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest memory fault at {addr:#x} ({size} bytes)")]
pub struct MemFault {
    pub addr: u64,
    pub size: usize,
}

pub trait GuestMem {
    fn read(&mut self, addr: u64, out: &mut [u8]) -> Result<(), MemFault>;
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), MemFault>;

    /// TSO load: acquire ordering against other TSO accesses.
    fn read_tso(&mut self, addr: u64, out: &mut [u8]) -> Result<(), MemFault> {
        let r = self.read(addr, out);
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
        r
    }

    /// TSO store: release ordering against other TSO accesses.
    fn write_tso(&mut self, addr: u64, data: &[u8]) -> Result<(), MemFault> {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        self.write(addr, data)
    }

    /// Sequentially consistent compare-and-swap. Returns the previous
    /// value through `prev` and whether the swap happened.
    fn cas(
        &mut self,
        addr: u64,
        expected: &[u8],
        desired: &[u8],
        prev: &mut [u8],
    ) -> Result<bool, MemFault> {
        self.read(addr, prev)?;
        if prev == expected {
            self.write(addr, desired)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn fence(&mut self, kind: FenceKind) {
        use std::sync::atomic::{fence, Ordering};
        match kind {
            FenceKind::Load => fence(Ordering::Acquire),
            FenceKind::Store => fence(Ordering::Release),
            FenceKind::LoadStore => fence(Ordering::SeqCst),
        }
    }

    /// Cache maintenance; a no-op for plain buffers.
    fn cache_line_clear(&mut self, _addr: u64) {}
}

/// Flat little-endian test bus.
pub struct VecMem {
    data: Vec<u8>,
}

impl VecMem {
    pub fn new(size: usize) -> Self {
        VecMem {
            data: vec![0; size],
        }
    }

    pub fn load(&mut self, addr: u64, bytes: &[u8]) {
        self.data[addr as usize..addr as usize + bytes.len()].copy_from_slice(bytes);
    }

    fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>, MemFault> {
        let start = addr as usize;
        let end = start.checked_add(len).ok_or(MemFault { addr, size: len })?;
        if end > self.data.len() {
            return Err(MemFault { addr, size: len });
        }
        Ok(start..end)
    }
}

impl GuestMem for VecMem {
    fn read(&mut self, addr: u64, out: &mut [u8]) -> Result<(), MemFault> {
        let range = self.range(addr, out.len())?;
        out.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), MemFault> {
        let range = self.range(addr, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }
}

/// A guest memory shared between threads. The mutex makes every access
/// sequentially consistent, which over-satisfies both the TSO and the
/// relaxed contract.
#[derive(Clone)]
pub struct SharedMem {
    data: Arc<Mutex<Vec<u8>>>,
}

impl SharedMem {
    pub fn new(size: usize) -> Self {
        SharedMem {
            data: Arc::new(Mutex::new(vec![0; size])),
        }
    }
}

impl GuestMem for SharedMem {
    fn read(&mut self, addr: u64, out: &mut [u8]) -> Result<(), MemFault> {
        let data = self.data.lock().unwrap();
        let start = addr as usize;
        let end = start
            .checked_add(out.len())
            .filter(|&e| e <= data.len())
            .ok_or(MemFault {
                addr,
                size: out.len(),
            })?;
        out.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&mut self, addr: u64, data_in: &[u8]) -> Result<(), MemFault> {
        let mut data = self.data.lock().unwrap();
        let start = addr as usize;
        let end = start
            .checked_add(data_in.len())
            .filter(|&e| e <= data.len())
            .ok_or(MemFault {
                addr,
                size: data_in.len(),
            })?;
        data[start..end].copy_from_slice(data_in);
        Ok(())
    }

    fn cas(
        &mut self,
        addr: u64,
        expected: &[u8],
        desired: &[u8],
        prev: &mut [u8],
    ) -> Result<bool, MemFault> {
        // Read and write under one lock acquisition.
        let mut data = self.data.lock().unwrap();
        let start = addr as usize;
        let end = start
            .checked_add(prev.len())
            .filter(|&e| e <= data.len())
            .ok_or(MemFault {
                addr,
                size: prev.len(),
            })?;
        prev.copy_from_slice(&data[start..end]);
        if prev == expected {
            data[start..end].copy_from_slice(desired);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vecmem_bounds() {
        let mut m = VecMem::new(16);
        let mut buf = [0u8; 8];
        assert!(m.read(8, &mut buf).is_ok());
        assert_eq!(
            m.read(9, &mut buf),
            Err(MemFault { addr: 9, size: 8 })
        );
        assert!(m.write(u64::MAX, &buf).is_err());
    }

    #[test]
    fn cas_default_impl() {
        let mut m = VecMem::new(8);
        m.load(0, &5u32.to_le_bytes());
        let mut prev = [0u8; 4];
        let swapped = m
            .cas(0, &5u32.to_le_bytes(), &9u32.to_le_bytes(), &mut prev)
            .unwrap();
        assert!(swapped);
        assert_eq!(prev, 5u32.to_le_bytes());
        let swapped = m
            .cas(0, &5u32.to_le_bytes(), &1u32.to_le_bytes(), &mut prev)
            .unwrap();
        assert!(!swapped);
        assert_eq!(prev, 9u32.to_le_bytes());
    }
}
