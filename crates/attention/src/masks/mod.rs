//! Mask utilities for windowed attention.
//!
//! Masks are built host-side from per-row window centres and uploaded as
//! `f32` tensors shaped `[batch, source_len]`.

pub mod window;

pub use window::{gaussian_taper, snap_centres, window_bounds, window_mask};
