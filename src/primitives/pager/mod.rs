#![forbid(unsafe_code)]

mod frame;
mod pool;

pub use pool::{LatchMode, MemPool, PageAllocator, PageHandle, PageStore, PoolStats};
