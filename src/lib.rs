//! Sky-to-pixel resolution for skycell-tessellated survey images.
//!
//! Skycell maps sky positions onto the ring-and-band tessellation used by
//! large survey stacks: each position resolves to a projection cell, one of
//! its 10x10 sub-cell images and a pixel in that image. On top of the
//! resolver sits a sampler that stitches pixels from many cached survey
//! images into one output tile.

pub mod cache;
pub mod error;
pub mod filemap;
pub mod geom;
pub mod grid;
pub mod loader;
pub mod resolver;
pub mod sampler;
pub mod stretch;
