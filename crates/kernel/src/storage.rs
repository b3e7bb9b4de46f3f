//! Word-addressed atomic storage shared between worker threads.
//!
//! Every particle buffer, bucket counter and particle map is an
//! [`AtomicWords`]: a fixed-length array of `AtomicU32`. Workers write
//! disjoint words during a phase and phases are separated by barriers or
//! events, so all accesses use `Relaxed` ordering and the synchronization
//! primitive provides the happens-before edge. Floats are stored by bit
//! pattern.

use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Pod;
use glam::Vec3;

/// Fixed-length array of 32-bit words with atomic access.
#[derive(Debug)]
pub struct AtomicWords {
    words: Box<[AtomicU32]>,
}

impl AtomicWords {
    /// `len` zero words.
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Copy of `words`.
    pub fn from_words(words: &[u32]) -> Self {
        Self {
            words: words.iter().map(|&w| AtomicU32::new(w)).collect(),
        }
    }

    /// Word image of a slice of plain-old-data records.
    pub fn from_pod<T: Pod>(items: &[T]) -> Self {
        let bytes: &[u8] = bytemuck::cast_slice(items);
        debug_assert_eq!(bytes.len() % 4, 0);
        Self {
            words: bytes
                .chunks_exact(4)
                .map(|c| AtomicU32::new(u32::from_ne_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
        }
    }

    /// Number of words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// True when there are no words.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Word at `index`.
    #[inline]
    pub fn load(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Relaxed)
    }

    /// Set the word at `index`.
    #[inline]
    pub fn store(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Relaxed);
    }

    /// Word at `index` as a float.
    #[inline]
    pub fn load_f32(&self, index: usize) -> f32 {
        f32::from_bits(self.load(index))
    }

    /// Store the bits of `value` at `index`.
    #[inline]
    pub fn store_f32(&self, index: usize, value: f32) {
        self.store(index, value.to_bits());
    }

    /// Three consecutive floats starting at `index`.
    #[inline]
    pub fn load_vec3(&self, index: usize) -> Vec3 {
        Vec3::new(
            self.load_f32(index),
            self.load_f32(index + 1),
            self.load_f32(index + 2),
        )
    }

    /// Store three consecutive floats starting at `index`.
    #[inline]
    pub fn store_vec3(&self, index: usize, value: Vec3) {
        self.store_f32(index, value.x);
        self.store_f32(index + 1, value.y);
        self.store_f32(index + 2, value.z);
    }

    /// Atomically add `value`, returning the previous word.
    #[inline]
    pub fn fetch_add(&self, index: usize, value: u32) -> u32 {
        self.words[index].fetch_add(value, Ordering::Relaxed)
    }

    /// Atomically subtract `value`, returning the previous word.
    #[inline]
    pub fn fetch_sub(&self, index: usize, value: u32) -> u32 {
        self.words[index].fetch_sub(value, Ordering::Relaxed)
    }

    /// Set every word in `range` to `value`.
    pub fn fill(&self, range: Range<usize>, value: u32) {
        for w in &self.words[range] {
            w.store(value, Ordering::Relaxed);
        }
    }

    /// Overwrite words starting at `offset` with `data`.
    pub fn write_words(&self, offset: usize, data: &[u32]) {
        for (w, &v) in self.words[offset..offset + data.len()].iter().zip(data) {
            w.store(v, Ordering::Relaxed);
        }
    }

    /// Plain copy of all words.
    pub fn to_vec(&self) -> Vec<u32> {
        self.words.iter().map(|w| w.load(Ordering::Relaxed)).collect()
    }

    /// Copy of the leading words reinterpreted as `count` records of `T`.
    pub fn read_pod<T: Pod>(&self, count: usize) -> Vec<T> {
        let words_per = std::mem::size_of::<T>() / 4;
        let words: Vec<u32> = self.words[..count * words_per]
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect();
        bytemuck::pod_collect_to_vec(&words)
    }
}
