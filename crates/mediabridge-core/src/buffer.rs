//! Aligned Buffer and Aligned Buffer Pool.
//!
//! The engine writes video planes through raw pointers and assumes they are
//! aligned for SIMD stores. The allocator gives no such guarantee for a
//! `Vec<u8>`, so each buffer over-allocates by `alignment` bytes and exposes
//! a window that starts at the first aligned address:
//!
//! ```text
//! storage: |<- offset ->|<------------ capacity ------------>|<- rest ->|
//!          ^ raw start  ^ aligned start                                  ^ capacity + alignment
//! ```
//!
//! `offset` is `0` when the raw start is already aligned, otherwise
//! `alignment - (start % alignment)`, so it never exceeds `alignment - 1`.

use std::ops::Range;

use crate::error::{BridgeError, Result};

/// Forward distance from `address` to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
pub fn alignment_offset(address: usize, alignment: usize) -> usize {
    let misalignment = address & (alignment - 1);
    if misalignment == 0 {
        0
    } else {
        alignment - misalignment
    }
}

/// Usable window inside an allocation of `capacity + alignment` bytes that
/// starts at `address`.
pub fn aligned_window(address: usize, capacity: usize, alignment: usize) -> Result<Range<usize>> {
    if !alignment.is_power_of_two() {
        return Err(BridgeError::InvalidAlignment(alignment));
    }
    let total = capacity
        .checked_add(alignment)
        .ok_or(BridgeError::AlignmentAllocationFailure {
            capacity,
            alignment,
        })?;
    let offset = alignment_offset(address, alignment);
    debug_assert!(offset + capacity <= total);
    Ok(offset..offset + capacity)
}

/// A heap block whose visible slice starts on an `alignment` boundary.
pub struct AlignedBuffer {
    /// Never resized after construction, so its address is stable
    storage: Vec<u8>,
    window: Range<usize>,
    alignment: usize,
}

impl AlignedBuffer {
    /// Allocates `capacity` zeroed bytes aligned to `alignment`.
    pub fn allocate(capacity: usize, alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(BridgeError::InvalidAlignment(alignment));
        }
        let failure = BridgeError::AlignmentAllocationFailure {
            capacity,
            alignment,
        };
        let total = capacity.checked_add(alignment).ok_or(failure.clone())?;

        let mut storage = Vec::new();
        if storage.try_reserve_exact(total).is_err() {
            tracing::error!("allocation of {total} bytes for aligned buffer failed");
            return Err(failure);
        }
        storage.resize(total, 0);

        let window = aligned_window(storage.as_ptr() as usize, capacity, alignment)?;
        Ok(Self {
            storage,
            window,
            alignment,
        })
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Bytes skipped at the front of the allocation.
    pub fn offset(&self) -> usize {
        self.window.start
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.window.clone()]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.window.clone()]
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }

    /// Pointer handed to native code. Valid until the buffer is dropped.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.as_mut_slice().as_mut_ptr()
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .field("alignment", &self.alignment)
            .finish()
    }
}

/// One aligned buffer per picture plane, kept across frames.
#[derive(Debug)]
pub struct BufferPool {
    alignment: usize,
    plane_sizes: Vec<usize>,
    buffers: Vec<AlignedBuffer>,
    allocations: u64,
}

impl BufferPool {
    pub fn new(alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(BridgeError::InvalidAlignment(alignment));
        }
        Ok(Self {
            alignment,
            plane_sizes: Vec::new(),
            buffers: Vec::new(),
            allocations: 0,
        })
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Replaces the current buffers with fresh ones of `plane_sizes`.
    ///
    /// On failure the pool is left empty.
    pub fn allocate(&mut self, plane_sizes: &[usize]) -> Result<()> {
        self.clear();
        let buffers = plane_sizes
            .iter()
            .map(|&size| AlignedBuffer::allocate(size, self.alignment))
            .collect::<Result<Vec<_>>>()?;
        self.buffers = buffers;
        self.plane_sizes = plane_sizes.to_vec();
        self.allocations += 1;
        tracing::debug!(
            "allocated {} plane buffers {:?} aligned to {}",
            plane_sizes.len(),
            plane_sizes,
            self.alignment
        );
        Ok(())
    }

    /// Allocates only if `plane_sizes` differs from the current layout.
    /// Returns true when new buffers were allocated.
    pub fn ensure(&mut self, plane_sizes: &[usize]) -> Result<bool> {
        if !self.buffers.is_empty() && self.plane_sizes == plane_sizes {
            return Ok(false);
        }
        self.allocate(plane_sizes)?;
        Ok(true)
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.plane_sizes.clear();
    }

    pub fn is_allocated(&self) -> bool {
        !self.buffers.is_empty()
    }

    /// Number of times buffers were (re)allocated.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn buffers(&self) -> &[AlignedBuffer] {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut [AlignedBuffer] {
        &mut self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_for_every_start_address() {
        // Every possible allocator start modulo the alignment, twice over.
        for address in 0..64usize {
            let window = aligned_window(address, 1000, 32).unwrap();
            assert_eq!((address + window.start) % 32, 0, "address {address}");
            assert_eq!(window.len(), 1000);
            assert!(window.end <= 1000 + 32);
            assert!(window.start < 32);
        }
    }

    #[test]
    fn test_offset_values() {
        assert_eq!(alignment_offset(0, 32), 0);
        assert_eq!(alignment_offset(1, 32), 31);
        assert_eq!(alignment_offset(31, 32), 1);
        assert_eq!(alignment_offset(32, 32), 0);
        assert_eq!(alignment_offset(33, 16), 15);
    }

    #[test]
    fn test_rejects_bad_alignment() {
        assert_eq!(
            AlignedBuffer::allocate(16, 24).unwrap_err(),
            BridgeError::InvalidAlignment(24)
        );
        assert!(AlignedBuffer::allocate(16, 0).is_err());
        assert!(BufferPool::new(3).is_err());
    }

    #[test]
    fn test_overflowing_request_fails_cleanly() {
        assert_eq!(
            AlignedBuffer::allocate(usize::MAX, 32).unwrap_err(),
            BridgeError::AlignmentAllocationFailure {
                capacity: usize::MAX,
                alignment: 32
            }
        );
        assert!(matches!(
            AlignedBuffer::allocate(usize::MAX - 64, 32),
            Err(BridgeError::AlignmentAllocationFailure { .. })
        ));
    }

    #[test]
    fn test_allocated_buffer_is_aligned() {
        for alignment in [1, 2, 8, 32, 64, 4096] {
            let buffer = AlignedBuffer::allocate(1000, alignment).unwrap();
            assert_eq!(buffer.as_ptr() as usize % alignment, 0);
            assert_eq!(buffer.len(), 1000);
            assert!(buffer.offset() < alignment);
        }
    }

    #[test]
    fn test_write_read_back() {
        let mut buffer = AlignedBuffer::allocate(1000, 32).unwrap();
        let ptr = buffer.as_mut_ptr();
        // Simulated native writer going through the raw pointer.
        for i in 0..1000 {
            unsafe { ptr.add(i).write((i % 251) as u8) };
        }
        let expected: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        assert_eq!(buffer.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_pool_reuses_until_layout_changes() {
        let mut pool = BufferPool::new(32).unwrap();
        assert!(pool.ensure(&[640 * 4 * 480]).unwrap());
        let first = pool.buffers()[0].as_ptr();

        assert!(!pool.ensure(&[640 * 4 * 480]).unwrap());
        assert_eq!(pool.buffers()[0].as_ptr(), first);
        assert_eq!(pool.allocations(), 1);

        assert!(pool.ensure(&[320 * 240, 160 * 120, 160 * 120]).unwrap());
        assert_eq!(pool.buffers().len(), 3);
        assert_eq!(pool.allocations(), 2);

        pool.clear();
        assert!(!pool.is_allocated());
    }
}
