//! Descriptor heaps and descriptor table deduplication.

mod cache;
mod heap_pool;

pub use cache::{DescriptorBudget, DescriptorCache, DescriptorHeapSet, DescriptorTableCache};
pub use heap_pool::{DescriptorHeap, DescriptorHeapPool};
