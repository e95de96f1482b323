// SPDX-License-Identifier: BSD-3-Clause

pub mod buffer;
pub mod pool;

pub use buffer::Buffer;
pub use pool::ChunkPool;
