//! Runtime accounting for the memory regions sized by the
//! [`MemoryBudget`](crate::resources::MemoryBudget).
//!
//! The pools only track reservations; the dataflow engine that actually
//! uses the memory lives outside this crate and reports through
//! `reserve`/`release`. Metric gauges read the counters lock-free.

use crate::config::MemorySize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct MemoryPool {
    name: &'static str,
    total: u64,
    used: AtomicU64,
}

impl MemoryPool {
    pub fn new(name: &'static str, total: MemorySize) -> Self {
        Self {
            name,
            total: total.bytes(),
            used: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn total(&self) -> MemorySize {
        MemorySize::from_bytes(self.total)
    }

    pub fn used(&self) -> MemorySize {
        MemorySize::from_bytes(self.used.load(Ordering::Relaxed))
    }

    pub fn available(&self) -> MemorySize {
        self.total().saturating_sub(self.used())
    }

    /// Reserves `size` bytes; fails without side effects when the pool would
    /// be overcommitted.
    pub fn reserve(&self, size: MemorySize) -> bool {
        let request = size.bytes();
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |used| {
                used.checked_add(request).filter(|next| *next <= self.total)
            })
            .is_ok()
    }

    pub fn release(&self, size: MemorySize) {
        let request = size.bytes();
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(request))
            });
    }
}

/// Fixed-size segments backing the data-transport buffers.
#[derive(Debug)]
pub struct NetworkBufferPool {
    segment_size: u64,
    total_segments: u64,
    available: AtomicU64,
}

impl NetworkBufferPool {
    pub fn new(segment_size: MemorySize, total_segments: u64) -> Self {
        Self {
            segment_size: segment_size.bytes(),
            total_segments,
            available: AtomicU64::new(total_segments),
        }
    }

    pub fn segment_size(&self) -> MemorySize {
        MemorySize::from_bytes(self.segment_size)
    }

    pub fn total_segments(&self) -> u64 {
        self.total_segments
    }

    pub fn available_segments(&self) -> u64 {
        self.available.load(Ordering::Relaxed)
    }

    pub fn used_segments(&self) -> u64 {
        self.total_segments
            .saturating_sub(self.available_segments())
    }

    pub fn total_memory(&self) -> MemorySize {
        MemorySize::from_bytes(self.total_segments.saturating_mul(self.segment_size))
    }

    pub fn available_memory(&self) -> MemorySize {
        MemorySize::from_bytes(self.available_segments().saturating_mul(self.segment_size))
    }

    pub fn used_memory(&self) -> MemorySize {
        MemorySize::from_bytes(self.used_segments().saturating_mul(self.segment_size))
    }

    pub fn request_segments(&self, count: u64) -> bool {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |available| {
                available.checked_sub(count)
            })
            .is_ok()
    }

    pub fn recycle_segments(&self, count: u64) {
        let _ = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |available| {
                Some(available.saturating_add(count).min(self.total_segments))
            });
    }
}
