//! Content-addressed artifact keys.
//!
//! Every artifact written by the pipeline is named by a digest of the full set
//! of inputs that determine its bytes. Two logically equal inputs always hash
//! to the same key; distinct inputs are assumed (not guaranteed) to hash to
//! distinct keys. Collisions are an accepted, documented risk — the digest
//! width is a tuning knob, and nothing downstream detects or corrects a
//! collision.

use xxhash_rust::xxh3::Xxh3;

use crate::params::{FrameParameters, ParameterSequence};

/// A short fixed-length digest identifying one artifact's inputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArtifactKey(pub u128);

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Canonical serializer feeding the digest.
///
/// Field order is fixed by the caller; strings are length-prefixed, floats are
/// written as their bit patterns, and `Option`s carry a presence tag so that
/// `None` followed by `x` never collides with `Some(x)` followed by nothing.
pub struct KeyWriter {
    hasher: Xxh3,
}

impl KeyWriter {
    pub fn new() -> Self {
        Self {
            hasher: Xxh3::new(),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u64(bytes.len() as u64);
        self.hasher.update(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.hasher.update(&[v]);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.hasher.update(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.hasher.update(&v.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_u64(v.to_bits());
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    pub fn write_opt_f64(&mut self, v: Option<f64>) {
        match v {
            Some(x) => {
                self.write_u8(1);
                self.write_f64(x);
            }
            None => self.write_u8(0),
        }
    }

    pub fn write_opt_vec3(&mut self, v: Option<[f64; 3]>) {
        match v {
            Some(x) => {
                self.write_u8(1);
                for c in x {
                    self.write_f64(c);
                }
            }
            None => self.write_u8(0),
        }
    }

    pub fn finish(self) -> ArtifactKey {
        ArtifactKey(self.hasher.digest128())
    }
}

impl Default for KeyWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Types whose artifact-relevant fields can be fed to a [`KeyWriter`].
pub trait Keyed {
    fn write_key(&self, w: &mut KeyWriter);
}

impl Keyed for FrameParameters {
    fn write_key(&self, w: &mut KeyWriter) {
        w.write_opt_f64(self.angle);
        w.write_opt_vec3(self.eye);
        for c in self.at {
            w.write_f64(c);
        }
        for c in self.up {
            w.write_f64(c);
        }
        w.write_bool(self.right_handed);
        w.write_bool(self.at_relative);
        for c in self.u_range {
            w.write_f64(c);
        }
        for c in self.v_range {
            w.write_f64(c);
        }
        w.write_f64(self.near);
        w.write_f64(self.far);
        w.write_f64(self.image_distance);
        w.write_f64(self.step);
        w.write_str(&self.value_kernel);
        w.write_str(&self.derivative_kernel);
        w.write_u32(self.width);
        w.write_u32(self.height);
    }
}

impl Keyed for ParameterSequence {
    fn write_key(&self, w: &mut KeyWriter) {
        w.write_u64(self.frames.len() as u64);
        for frame in &self.frames {
            frame.write_key(w);
        }
    }
}

/// Key a single value with no extra stage inputs.
pub fn key_of(value: &impl Keyed) -> ArtifactKey {
    let mut w = KeyWriter::new();
    value.write_key(&mut w);
    w.finish()
}
