//! Coding-layer primitives: field arithmetic and the stripe codecs.

pub mod codec;
pub mod gf;
