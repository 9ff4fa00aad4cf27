use blade_accel_hal::{self as hal, AccelerationStructureEncoder as _};
use std::{mem, ops::Range};

use crate::{
    config::Config,
    geometry::GeometryInput,
    resource::{one_off, AccelerationStructure},
    scratch::{BuildSizing, PersistentScratch, ScratchBudgetAllocator, ScratchPlan},
    Error,
};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BuildStats {
    pub built: usize,
    pub batches: usize,
    pub scratch_size: u64,
    /// Summed size of the structures before compaction.
    pub uncompacted_size: u64,
    /// Summed size of the structures as they were kept.
    pub final_size: u64,
    pub compacted: usize,
    pub compaction_skipped: usize,
}

/// Result of [`BlasBuilder::build`]: structures in input order.
pub struct BlasBatch<D: hal::ResourceDevice> {
    pub structures: Vec<AccelerationStructure<D>>,
    pub stats: BuildStats,
}

pub struct BlasBuilder<'a, D: hal::Device> {
    gpu: &'a D,
    memory_budget: u64,
    max_batch_size: usize,
}

impl<'a, D: hal::Device> BlasBuilder<'a, D> {
    pub fn new(gpu: &'a D, config: &Config) -> Self {
        Self::with_limits(gpu, config.batch_memory_budget, config.max_batch_size)
    }

    pub fn with_limits(gpu: &'a D, memory_budget: u64, max_batch_size: usize) -> Self {
        Self {
            gpu,
            memory_budget,
            max_batch_size,
        }
    }

    fn query_sizings(
        &self,
        inputs: &[GeometryInput<D::Buffer>],
        flags: hal::AccelerationStructureFlags,
    ) -> Result<Vec<BuildSizing>, Error> {
        inputs
            .iter()
            .map(|input| {
                if input.geometries.is_empty() {
                    return Err(Error::InvalidGeometry(format!(
                        "input '{}' has no geometry",
                        input.name
                    )));
                }
                self.gpu
                    .get_bottom_level_acceleration_structure_sizes(
                        &input.geometries,
                        flags | input.flags,
                    )
                    .map(BuildSizing::from)
                    .map_err(|e| Error::build_failure(&input.name, e))
            })
            .collect()
    }

    /// Build one bottom-level structure per input.
    ///
    /// Either every structure is built, or none survives the call.
    #[profiling::function]
    pub fn build(
        &self,
        inputs: &[GeometryInput<D::Buffer>],
        flags: hal::AccelerationStructureFlags,
    ) -> Result<BlasBatch<D>, Error> {
        let mut stats = BuildStats::default();
        if inputs.is_empty() {
            return Ok(BlasBatch {
                structures: Vec::new(),
                stats,
            });
        }

        let sizings = self.query_sizings(inputs, flags)?;
        let plan = ScratchBudgetAllocator::plan(&sizings);
        let scratch = self
            .gpu
            .create_buffer(hal::BufferDesc {
                name: "BLAS scratch",
                size: plan.buffer_size,
                memory: hal::Memory::Device,
            })
            .map_err(|e| Error::build_failure("BLAS scratch", e))?;
        stats.scratch_size = plan.buffer_size;
        stats.uncompacted_size = sizings.iter().map(|s| s.acceleration_structure_size).sum();

        let mut structures = Vec::with_capacity(inputs.len());
        let mut result = Ok(());
        for range in ScratchBudgetAllocator::batches(&sizings, self.memory_budget, self.max_batch_size)
        {
            result = self.build_batch(
                inputs,
                flags,
                &sizings,
                &plan,
                scratch,
                range,
                &mut structures,
                &mut stats,
            );
            if result.is_err() {
                break;
            }
            stats.batches += 1;
        }
        // Every batch has been waited on at this point.
        self.gpu.destroy_buffer(scratch);

        if let Err(e) = result {
            log::error!(
                "Bottom-level build failed, releasing {} structures",
                structures.len()
            );
            for structure in structures {
                structure.destroy(self.gpu);
            }
            return Err(e);
        }

        stats.built = structures.len();
        stats.final_size = structures.iter().map(|s| s.size()).sum();
        log::info!(
            "Built {} bottom-level structures in {} batches: {} bytes, {} after compaction, {} scratch",
            stats.built,
            stats.batches,
            stats.uncompacted_size,
            stats.final_size,
            stats.scratch_size,
        );
        Ok(BlasBatch { structures, stats })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_batch(
        &self,
        inputs: &[GeometryInput<D::Buffer>],
        flags: hal::AccelerationStructureFlags,
        sizings: &[BuildSizing],
        plan: &ScratchPlan,
        scratch: D::Buffer,
        range: Range<usize>,
        structures: &mut Vec<AccelerationStructure<D>>,
        stats: &mut BuildStats,
    ) -> Result<(), Error> {
        let first = structures.len();
        for index in range.clone() {
            let structure = AccelerationStructure::create(
                self.gpu,
                &inputs[index].name,
                hal::AccelerationStructureType::BottomLevel,
                sizings[index].acceleration_structure_size,
            )
            .map_err(|e| Error::build_failure(&inputs[index].name, e))?;
            log::debug!(
                "Allocated '{}' with {} bytes for {} primitives",
                inputs[index].name,
                structure.size(),
                inputs[index].primitive_count()
            );
            structures.push(structure);
        }

        // Positions within the batch of the builds that asked for compaction.
        let compactable = range
            .clone()
            .enumerate()
            .filter(|&(_, index)| {
                (flags | inputs[index].flags)
                    .contains(hal::AccelerationStructureFlags::ALLOW_COMPACTION)
            })
            .map(|(slot, _)| slot)
            .collect::<Vec<_>>();
        let pool = if compactable.is_empty() {
            None
        } else {
            match self.gpu.create_query_pool(hal::QueryPoolDesc {
                name: "BLAS compacted sizes",
                count: compactable.len() as u32,
            }) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    log::warn!("Unable to create a compaction query pool: {}", e);
                    stats.compaction_skipped += compactable.len();
                    None
                }
            }
        };

        let batch = &structures[first..];
        let submitted = one_off(self.gpu, "BLAS build", |encoder| {
            for (slot, index) in range.clone().enumerate() {
                // Builds share the scratch region.
                if slot != 0 {
                    encoder.barrier();
                }
                encoder.build_bottom_level(
                    batch[slot].raw(),
                    &inputs[index].geometries,
                    flags | inputs[index].flags,
                    hal::BuildMode::Build,
                    plan.piece(scratch, index),
                );
            }
            if let Some(pool) = pool {
                encoder.barrier();
                let raws = compactable
                    .iter()
                    .map(|&slot| batch[slot].raw())
                    .collect::<Vec<_>>();
                encoder.write_compacted_sizes(&raws, pool, 0);
            }
        });
        if let Err(e) = submitted {
            if let Some(pool) = pool {
                self.gpu.destroy_query_pool(pool);
            }
            return Err(Error::build_failure(&inputs[range.start].name, e));
        }

        if let Some(pool) = pool {
            self.compact(
                &inputs[range.clone()],
                &mut structures[first..],
                &compactable,
                pool,
                stats,
            );
            self.gpu.destroy_query_pool(pool);
        }
        Ok(())
    }

    /// Replace the structures at `slots` with compacted copies where it
    /// saves memory. Query `i` of the pool holds the size for `slots[i]`.
    /// Failures only leave entries uncompacted.
    fn compact(
        &self,
        inputs: &[GeometryInput<D::Buffer>],
        structures: &mut [AccelerationStructure<D>],
        slots: &[usize],
        pool: D::QueryPool,
        stats: &mut BuildStats,
    ) {
        let sizes = match self.gpu.get_query_pool_results(pool, slots.len() as u32) {
            Ok(sizes) => sizes,
            Err(e) => {
                log::warn!(
                    "Compacted sizes of {} structures are unavailable, keeping them as built: {}",
                    slots.len(),
                    e
                );
                stats.compaction_skipped += slots.len();
                return;
            }
        };

        let mut targets = Vec::new();
        for (&index, &size) in slots.iter().zip(sizes.iter()) {
            let structure = &structures[index];
            if size == 0 || size >= structure.size() {
                log::warn!(
                    "Compacting '{}' would not save memory ({} of {} bytes)",
                    inputs[index].name,
                    size,
                    structure.size()
                );
                stats.compaction_skipped += 1;
                continue;
            }
            match AccelerationStructure::create(
                self.gpu,
                &inputs[index].name,
                hal::AccelerationStructureType::BottomLevel,
                size,
            ) {
                Ok(compacted) => targets.push((index, compacted)),
                Err(e) => {
                    log::warn!(
                        "Unable to allocate compacted '{}': {}",
                        inputs[index].name,
                        e
                    );
                    stats.compaction_skipped += 1;
                }
            }
        }
        if targets.is_empty() {
            return;
        }

        let copied = one_off(self.gpu, "BLAS compaction", |encoder| {
            for &(index, ref compacted) in targets.iter() {
                encoder.copy_compacted(structures[index].raw(), compacted.raw());
            }
        });
        match copied {
            Ok(()) => {
                for (index, compacted) in targets {
                    log::debug!(
                        "Compacted '{}' from {} to {} bytes",
                        inputs[index].name,
                        structures[index].size(),
                        compacted.size()
                    );
                    let original = mem::replace(&mut structures[index], compacted.into_compacted());
                    original.destroy(self.gpu);
                    stats.compacted += 1;
                }
            }
            Err(e) => {
                log::warn!(
                    "Compaction copy of {} structures failed, keeping them as built: {}",
                    targets.len(),
                    e
                );
                stats.compaction_skipped += targets.len();
                for (_, compacted) in targets {
                    compacted.destroy(self.gpu);
                }
            }
        }
    }

    /// Refit structures in place after their input data has moved.
    ///
    /// The structures must have been built from the same inputs with
    /// `ALLOW_UPDATE`.
    #[profiling::function]
    pub fn refit(
        &self,
        structures: &[AccelerationStructure<D>],
        inputs: &[GeometryInput<D::Buffer>],
        flags: hal::AccelerationStructureFlags,
        scratch: &mut PersistentScratch<D>,
    ) -> Result<(), Error> {
        if structures.len() != inputs.len() {
            return Err(Error::InvalidUpdate(format!(
                "{} structures are given {} inputs",
                structures.len(),
                inputs.len()
            )));
        }
        if let Some(input) = inputs
            .iter()
            .find(|input| !(flags | input.flags).contains(hal::AccelerationStructureFlags::ALLOW_UPDATE))
        {
            return Err(Error::InvalidUpdate(format!(
                "'{}' is not built for updates",
                input.name
            )));
        }
        if inputs.is_empty() {
            return Ok(());
        }

        let sizings = self.query_sizings(inputs, flags)?;
        let plan = ScratchBudgetAllocator::plan_update(&sizings);
        let scratch_piece = scratch
            .ensure(self.gpu, plan.buffer_size)
            .map_err(|e| Error::build_failure("BLAS update scratch", e))?;
        one_off(self.gpu, "BLAS refit", |encoder| {
            for (index, (structure, input)) in structures.iter().zip(inputs).enumerate() {
                if index != 0 {
                    encoder.barrier();
                }
                encoder.build_bottom_level(
                    structure.raw(),
                    &input.geometries,
                    flags | input.flags,
                    hal::BuildMode::Update,
                    plan.piece(scratch_piece.buffer, index),
                );
            }
        })
        .map_err(|e| Error::build_failure("BLAS refit", e))?;
        log::debug!("Refitted {} bottom-level structures", structures.len());
        Ok(())
    }
}
