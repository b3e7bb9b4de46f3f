//! Particle records and their packed buffer layout.
//!
//! A dynamic particle occupies eight 32-bit words, laid out as two 4-float
//! vectors so the same image can be uploaded to a device unchanged:
//!
//! ```text
//! word  0..3  position.xyz      word 3  pressure
//! word  4..7  velocity.xyz      word 7  hash (u32 bits in a float lane)
//! ```
//!
//! The hash is never aliased through overlapping fields; [`pack_hash`] and
//! [`unpack_hash`] are the only place its bits cross between `u32` and `f32`.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::storage::AtomicWords;

/// Fluid particle, rewritten every step.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable, serde::Serialize, serde::Deserialize)]
pub struct DynamicParticle {
    /// Position.
    pub position: Vec3,
    /// Pressure from the last pressure pass.
    pub pressure: f32,
    /// Velocity.
    pub velocity: Vec3,
    /// Bucket of the particle's cell, already reduced to the table size.
    pub hash: u32,
}

/// Solid boundary particle. Immutable once created.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable, serde::Serialize, serde::Deserialize)]
pub struct StaticParticle {
    /// Position.
    pub position: Vec3,
    /// Unused; kept for layout parity with [`DynamicParticle`].
    pub pressure: f32,
}

/// Words per dynamic particle.
pub const DYNAMIC_WORDS: usize = 8;
/// Words per static particle.
pub const STATIC_WORDS: usize = 4;

const POSITION: usize = 0;
const PRESSURE: usize = 3;
const VELOCITY: usize = 4;
const HASH: usize = 7;

/// Reinterpret a hash as a float-sized lane.
#[inline]
pub fn pack_hash(hash: u32) -> f32 {
    f32::from_bits(hash)
}

/// Inverse of [`pack_hash`].
#[inline]
pub fn unpack_hash(lane: f32) -> u32 {
    lane.to_bits()
}

/// A dynamic particle as two 4-float vectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackedParticle {
    /// `position.xyz, pressure`.
    pub position_pressure: [f32; 4],
    /// `velocity.xyz, pack_hash(hash)`.
    pub velocity_hash: [f32; 4],
}

impl DynamicParticle {
    /// Particle at rest state: zero pressure, hash not yet computed.
    pub fn new(position: Vec3, velocity: Vec3) -> Self {
        Self {
            position,
            pressure: 0.0,
            velocity,
            hash: 0,
        }
    }

    /// Two-vector form used by device buffers.
    pub fn pack(&self) -> PackedParticle {
        PackedParticle {
            position_pressure: [self.position.x, self.position.y, self.position.z, self.pressure],
            velocity_hash: [
                self.velocity.x,
                self.velocity.y,
                self.velocity.z,
                pack_hash(self.hash),
            ],
        }
    }

    /// Inverse of [`DynamicParticle::pack`].
    pub fn unpack(packed: &PackedParticle) -> Self {
        let [px, py, pz, pressure] = packed.position_pressure;
        let [vx, vy, vz, hash] = packed.velocity_hash;
        Self {
            position: Vec3::new(px, py, pz),
            pressure,
            velocity: Vec3::new(vx, vy, vz),
            hash: unpack_hash(hash),
        }
    }
}

impl StaticParticle {
    /// Boundary particle at `position`.
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            pressure: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Typed views over atomic word buffers
// ---------------------------------------------------------------------------

/// Dynamic particle records stored in an [`AtomicWords`] buffer.
#[derive(Debug, Clone, Copy)]
pub struct DynamicView<'a> {
    words: &'a AtomicWords,
}

impl<'a> DynamicView<'a> {
    /// View `words` as dynamic particles.
    pub fn new(words: &'a AtomicWords) -> Self {
        debug_assert_eq!(words.len() % DYNAMIC_WORDS, 0);
        Self { words }
    }

    /// Number of particles.
    pub fn len(&self) -> usize {
        self.words.len() / DYNAMIC_WORDS
    }

    /// True when the buffer holds no particles.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of particle `i`.
    #[inline]
    pub fn position(&self, i: usize) -> Vec3 {
        self.words.load_vec3(i * DYNAMIC_WORDS + POSITION)
    }

    /// Pressure of particle `i`.
    #[inline]
    pub fn pressure(&self, i: usize) -> f32 {
        self.words.load_f32(i * DYNAMIC_WORDS + PRESSURE)
    }

    /// Velocity of particle `i`.
    #[inline]
    pub fn velocity(&self, i: usize) -> Vec3 {
        self.words.load_vec3(i * DYNAMIC_WORDS + VELOCITY)
    }

    /// Stored bucket of particle `i`.
    #[inline]
    pub fn hash(&self, i: usize) -> u32 {
        self.words.load(i * DYNAMIC_WORDS + HASH)
    }

    /// Whole record of particle `i`.
    pub fn get(&self, i: usize) -> DynamicParticle {
        DynamicParticle {
            position: self.position(i),
            pressure: self.pressure(i),
            velocity: self.velocity(i),
            hash: self.hash(i),
        }
    }

    /// Overwrite the whole record of particle `i`.
    pub fn set(&self, i: usize, p: &DynamicParticle) {
        let base = i * DYNAMIC_WORDS;
        self.words.store_vec3(base + POSITION, p.position);
        self.words.store_f32(base + PRESSURE, p.pressure);
        self.words.store_vec3(base + VELOCITY, p.velocity);
        self.words.store(base + HASH, p.hash);
    }

    /// Overwrite position, velocity and hash, leaving pressure untouched.
    #[inline]
    pub fn set_motion(&self, i: usize, position: Vec3, velocity: Vec3, hash: u32) {
        let base = i * DYNAMIC_WORDS;
        self.words.store_vec3(base + POSITION, position);
        self.words.store_vec3(base + VELOCITY, velocity);
        self.words.store(base + HASH, hash);
    }

    /// Overwrite only the hash of particle `i`.
    #[inline]
    pub fn set_hash(&self, i: usize, hash: u32) {
        self.words.store(i * DYNAMIC_WORDS + HASH, hash);
    }
}

/// Static particle records stored in an [`AtomicWords`] buffer.
#[derive(Debug, Clone, Copy)]
pub struct StaticView<'a> {
    words: &'a AtomicWords,
}

impl<'a> StaticView<'a> {
    /// View `words` as static particles.
    pub fn new(words: &'a AtomicWords) -> Self {
        debug_assert_eq!(words.len() % STATIC_WORDS, 0);
        Self { words }
    }

    /// Number of particles.
    pub fn len(&self) -> usize {
        self.words.len() / STATIC_WORDS
    }

    /// True when the buffer holds no particles.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of particle `i`.
    #[inline]
    pub fn position(&self, i: usize) -> Vec3 {
        self.words.load_vec3(i * STATIC_WORDS + POSITION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_word_layout() {
        assert_eq!(std::mem::size_of::<DynamicParticle>(), DYNAMIC_WORDS * 4);
        assert_eq!(std::mem::size_of::<StaticParticle>(), STATIC_WORDS * 4);
    }

    #[test]
    fn hash_survives_packing() {
        // Bit patterns that are NaN or denormal as floats must pass unchanged.
        for hash in [0_u32, 1, 0x7fc0_0001, 0xffff_ffff, 123_456_789] {
            let p = DynamicParticle {
                hash,
                ..DynamicParticle::new(Vec3::new(1.0, 2.0, 3.0), Vec3::X)
            };
            let back = DynamicParticle::unpack(&p.pack());
            assert_eq!(back.hash, hash);
            assert_eq!(back.position, p.position);
        }
    }

    #[test]
    fn pod_image_matches_view_layout() {
        let particles = vec![
            DynamicParticle {
                position: Vec3::new(1.0, 2.0, 3.0),
                pressure: 4.0,
                velocity: Vec3::new(5.0, 6.0, 7.0),
                hash: 8,
            },
            DynamicParticle::new(Vec3::splat(-1.0), Vec3::ZERO),
        ];
        let words = AtomicWords::from_pod(&particles);
        let view = DynamicView::new(&words);
        assert_eq!(view.len(), 2);
        assert_eq!(view.get(0), particles[0]);
        assert_eq!(view.get(1), particles[1]);
        assert_eq!(words.load(7), 8);
    }

    #[test]
    fn set_motion_keeps_pressure() {
        let words = AtomicWords::zeroed(DYNAMIC_WORDS);
        let view = DynamicView::new(&words);
        view.set(0, &DynamicParticle { pressure: 2.5, ..Default::default() });
        view.set_motion(0, Vec3::ONE, Vec3::Y, 42);
        let p = view.get(0);
        assert_eq!(p.pressure, 2.5);
        assert_eq!(p.position, Vec3::ONE);
        assert_eq!(p.velocity, Vec3::Y);
        assert_eq!(p.hash, 42);
    }

    #[test]
    fn static_view_reads_positions() {
        let statics = [StaticParticle::new(Vec3::new(0.5, 0.0, -0.5))];
        let words = AtomicWords::from_pod(&statics);
        let view = StaticView::new(&words);
        assert_eq!(view.len(), 1);
        assert_eq!(view.position(0), Vec3::new(0.5, 0.0, -0.5));
    }
}
