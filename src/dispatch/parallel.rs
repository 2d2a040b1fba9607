//! Parallel hit group binding.
//!
//! Bindings are handed out in chunks through a shared atomic cursor. Each
//! worker owns one descriptor table cache and one shader record cache of the
//! target table, and stages its record writes instead of touching the
//! table. The calling thread applies the staged writes once every worker has
//! joined.
//!
//! ```text
//!   cursor ──► [chunk 0][chunk 1][chunk 2] ...
//!                 │        │        │
//!              worker 0 worker 1 worker 0     (whoever is free)
//!                 │        │
//!                 ▼        ▼
//!              staged   staged  ──► applied in worker order
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::binder::{DescriptorTarget, LocalResourceBinder, ShaderBindings, set_shader_resources};
use crate::backend::{GpuBuffer, RayTracingBackend, ResourceId};
use crate::descriptor::{DescriptorHeapSet, DescriptorTableCache};
use crate::errors::{RayTracingError, Result};
use crate::identifier::{SHADER_IDENTIFIER_SIZE, ShaderIdentifier};
use crate::pipeline::RayTracingPipeline;
use crate::shader_table::{
    BindingTargets, HIT_GROUP_SYSTEM_PARAMETERS_SIZE, HIT_GROUP_USER_DATA_OFFSET, ShaderRecordCache,
    ShaderRecordCacheKey, ShaderTable, ShaderTableLayout,
};
use crate::stats::{self, RayTracingStats};

/// Hit group and resources for one (instance, segment, slot) record.
#[derive(Debug, Clone, Default)]
pub struct HitGroupBinding {
    pub instance_index: u32,
    pub segment_index: u32,
    pub shader_slot: u32,
    /// Index into the pipeline's hit group shaders.
    pub hit_group_index: u32,
    pub bindings: ShaderBindings,
    /// Written into the record's system root constants.
    pub user_data: u32,
}

/// Shared, read-only inputs of one binding batch.
pub(crate) struct BindingJob<'a> {
    pub backend: &'a Arc<dyn RayTracingBackend>,
    pub stats: &'a RayTracingStats,
    pub pipeline: &'a RayTracingPipeline,
    pub bindings: &'a [HitGroupBinding],
    /// Record index of each binding.
    pub record_indices: &'a [u32],
    pub use_record_cache: bool,
    pub chunk_size: usize,
    pub gpu_index: u32,
}

#[derive(Debug)]
enum StagedWrite {
    Record { index: u32, bytes: Vec<u8> },
    /// Copy the user arguments (past the system parameters) of `source`.
    CopyParameters { dest: u32, source: u32 },
}

#[derive(Debug, Default)]
struct WorkerOutput {
    writes: Vec<StagedWrite>,
    residency: Vec<ResourceId>,
    transient_buffers: Vec<Arc<GpuBuffer>>,
    records: u64,
    cache_hits: u64,
    dropped: u32,
}

/// Outcome of one binding batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindingSummary {
    pub written: u64,
    pub cache_hits: u64,
    pub dropped: u32,
    pub workers: usize,
}

/// Copies record `record_index` out of the arena and stamps a new
/// identifier and user data into the copy.
pub(crate) fn stage_record(
    layout: &ShaderTableLayout,
    data: &[u8],
    record_index: u32,
    identifier: &ShaderIdentifier,
    user_data: u32,
) -> Vec<u8> {
    let offset = layout.local_record_offset(record_index) as usize;
    let size = layout.local_record_size_unaligned as usize;
    let mut record = data[offset..offset + size].to_vec();
    record[..SHADER_IDENTIFIER_SIZE].copy_from_slice(identifier.as_bytes());
    if layout.local_root_data_size >= HIT_GROUP_SYSTEM_PARAMETERS_SIZE {
        let at = SHADER_IDENTIFIER_SIZE + HIT_GROUP_USER_DATA_OFFSET as usize;
        record[at..at + 4].copy_from_slice(&user_data.to_le_bytes());
    }
    record
}

fn run_worker(
    job: &BindingJob<'_>,
    layout: &ShaderTableLayout,
    data: &[u8],
    heaps: &DescriptorHeapSet,
    descriptor_cache: &mut DescriptorTableCache,
    record_cache: &mut ShaderRecordCache,
    cursor: &AtomicUsize,
) -> Result<WorkerOutput> {
    let mut out = WorkerOutput::default();
    let library = job.pipeline.hit_group_shaders();
    let total = job.bindings.len();
    let chunk = job.chunk_size.max(1);

    loop {
        let start = cursor.fetch_add(chunk, Ordering::Relaxed);
        if start >= total {
            break;
        }
        let end = (start + chunk).min(total);

        for (binding, &record_index) in job.bindings[start..end]
            .iter()
            .zip(&job.record_indices[start..end])
        {
            let shader = library.shader(binding.hit_group_index);
            let mut record = stage_record(
                layout,
                data,
                record_index,
                &library.identifier(binding.hit_group_index),
                binding.user_data,
            );

            let key = if job.use_record_cache && binding.bindings.is_uniform_buffer_only() {
                binding
                    .bindings
                    .uniform_buffer_identities()
                    .filter(|ids| !ids.is_empty())
                    .and_then(|ids| ShaderRecordCacheKey::new(binding.hit_group_index, &ids))
            } else {
                None
            };

            if let Some(source) = key.as_ref().and_then(|key| record_cache.find(key)) {
                out.writes.push(StagedWrite::Record {
                    index: record_index,
                    bytes: record,
                });
                out.writes.push(StagedWrite::CopyParameters {
                    dest: record_index,
                    source,
                });
                out.records += 1;
                out.cache_hits += 1;
                continue;
            }

            let mut binder = LocalResourceBinder {
                backend: job.backend,
                gpu_index: job.gpu_index,
                root_signature: shader.root_signature(),
                record: &mut record,
                residency: &mut out.residency,
                transient_buffers: &mut out.transient_buffers,
            };
            let bound = set_shader_resources(
                shader,
                &binding.bindings,
                DescriptorTarget {
                    heaps,
                    cache: descriptor_cache,
                },
                &mut binder,
                job.stats,
            )?;
            if !bound {
                out.dropped += 1;
                continue;
            }

            out.writes.push(StagedWrite::Record {
                index: record_index,
                bytes: record,
            });
            out.records += 1;
            if let Some(key) = key {
                record_cache.insert(key, record_index);
            }
        }
    }
    Ok(out)
}

/// Binds `job.bindings` into `table` with up to `num_workers` threads.
///
/// With one worker everything runs on the calling thread.
pub(crate) fn bind_hit_groups(
    table: &mut ShaderTable,
    job: &BindingJob<'_>,
    num_workers: usize,
) -> Result<BindingSummary> {
    debug_assert_eq!(job.bindings.len(), job.record_indices.len());
    let num_workers = num_workers.max(1);

    let outputs: Vec<Result<WorkerOutput>> = {
        let BindingTargets {
            layout,
            data,
            heaps,
            descriptor_workers,
            record_caches,
        } = table.binding_targets(num_workers);
        let Some(heaps) = heaps else {
            return Err(RayTracingError::InvalidShaderTable(
                "shader table has no local records to bind".into(),
            ));
        };
        let cursor = AtomicUsize::new(0);
        let workers = descriptor_workers
            .iter_mut()
            .zip(record_caches.iter_mut())
            .take(num_workers);

        if num_workers == 1 {
            workers
                .map(|(descriptors, records)| {
                    run_worker(job, layout, data, heaps, descriptors, records, &cursor)
                })
                .collect()
        } else {
            std::thread::scope(|scope| {
                let cursor = &cursor;
                let handles: Vec<_> = workers
                    .map(|(descriptors, records)| {
                        scope.spawn(move || {
                            run_worker(job, layout, data, heaps, descriptors, records, cursor)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
                    })
                    .collect()
            })
        }
    };

    let mut summary = BindingSummary {
        workers: num_workers,
        ..Default::default()
    };
    for output in outputs {
        let output = output?;
        for write in output.writes {
            match write {
                StagedWrite::Record { index, bytes } => table.write_local_record(index, &bytes),
                StagedWrite::CopyParameters { dest, source } => {
                    table.copy_local_shader_parameters(dest, source, HIT_GROUP_SYSTEM_PARAMETERS_SIZE);
                }
            }
        }
        table.extend_resource_references(output.residency);
        for buffer in output.transient_buffers {
            table.retain_transient_buffer(buffer);
        }
        summary.written += output.records;
        summary.cache_hits += output.cache_hits;
        summary.dropped += output.dropped;
    }

    stats::add(&job.stats.shader_record_writes, summary.written);
    stats::add(&job.stats.record_cache_hits, summary.cache_hits);
    if summary.dropped > 0 {
        log::warn!(
            "{} of {} hit group bindings were dropped",
            summary.dropped,
            job.bindings.len()
        );
    }
    Ok(summary)
}
