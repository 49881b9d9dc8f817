// SPDX-License-Identifier: GPL-2.0-or-later

pub mod aac;
mod bits;
pub mod h264;
pub mod h265;
pub mod opus;

pub use bits::{BitReader, BitReaderError};
