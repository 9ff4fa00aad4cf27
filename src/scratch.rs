use blade_accel_hal::{self as hal, BufferHandle as _};
use std::ops::Range;

/// Sizes the device reported for one pending build.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BuildSizing {
    pub acceleration_structure_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

impl From<hal::AccelerationStructureSizes> for BuildSizing {
    fn from(sizes: hal::AccelerationStructureSizes) -> Self {
        Self {
            acceleration_structure_size: sizes.data,
            build_scratch_size: sizes.scratch,
            update_scratch_size: sizes.update_scratch,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScratchPlan {
    pub buffer_size: u64,
    pub per_build_offset: Vec<u64>,
    requirements: Vec<u64>,
}

impl ScratchPlan {
    /// Offset of the scratch region for the build at `index`.
    pub fn offset(&self, index: usize) -> u64 {
        let offset = self.per_build_offset[index];
        assert!(
            offset + self.requirements[index] <= self.buffer_size,
            "Scratch region of build {} does not fit into {} bytes",
            index,
            self.buffer_size
        );
        offset
    }

    pub fn piece<B: hal::BufferHandle>(&self, buffer: B, index: usize) -> hal::GenericBufferPiece<B> {
        buffer.at(self.offset(index))
    }
}

/// Plans scratch memory for a batch of builds.
///
/// Builds in a batch run one after another on a single command stream,
/// separated by barriers, so a single region sized for the largest build
/// is shared by all of them.
pub struct ScratchBudgetAllocator;

impl ScratchBudgetAllocator {
    fn plan_with(sizings: &[BuildSizing], requirement: impl Fn(&BuildSizing) -> u64) -> ScratchPlan {
        let requirements = sizings.iter().map(requirement).collect::<Vec<_>>();
        ScratchPlan {
            buffer_size: requirements.iter().copied().max().unwrap_or(0),
            per_build_offset: vec![0; sizings.len()],
            requirements,
        }
    }

    pub fn plan(sizings: &[BuildSizing]) -> ScratchPlan {
        Self::plan_with(sizings, |s| s.build_scratch_size)
    }

    pub fn plan_update(sizings: &[BuildSizing]) -> ScratchPlan {
        Self::plan_with(sizings, |s| s.update_scratch_size)
    }

    /// Split builds into consecutive batches whose summed uncompacted size
    /// stays within `memory_budget` and whose length is at most `max_count`.
    /// A build larger than the budget gets a batch of its own.
    pub fn batches(
        sizings: &[BuildSizing],
        memory_budget: u64,
        max_count: usize,
    ) -> Vec<Range<usize>> {
        let mut batches = Vec::new();
        let mut start = 0;
        let mut total = 0;
        for (index, sizing) in sizings.iter().enumerate() {
            let size = sizing.acceleration_structure_size;
            if index > start && total + size > memory_budget {
                batches.push(start..index);
                start = index;
                total = 0;
            }
            total += size;
            if index + 1 - start >= max_count.max(1) {
                batches.push(start..index + 1);
                start = index + 1;
                total = 0;
            }
        }
        if start < sizings.len() {
            batches.push(start..sizings.len());
        }
        batches
    }
}

/// Grow-only scratch buffer kept alive between updates.
pub struct PersistentScratch<D: hal::ResourceDevice> {
    buffer: Option<D::Buffer>,
    size: u64,
}

impl<D: hal::ResourceDevice> PersistentScratch<D> {
    pub fn new() -> Self {
        Self {
            buffer: None,
            size: 0,
        }
    }

    /// Make sure the buffer holds at least `size` bytes.
    ///
    /// The caller guarantees the device no longer uses the old buffer.
    pub fn ensure(
        &mut self,
        gpu: &D,
        size: u64,
    ) -> Result<hal::GenericBufferPiece<D::Buffer>, hal::DeviceError> {
        match self.buffer {
            Some(buffer) if self.size >= size => Ok(buffer.into()),
            _ => {
                let buffer = gpu.create_buffer(hal::BufferDesc {
                    name: "update scratch",
                    size,
                    memory: hal::Memory::Device,
                })?;
                if let Some(old) = self.buffer.replace(buffer) {
                    gpu.destroy_buffer(old);
                }
                log::debug!("Grew update scratch from {} to {} bytes", self.size, size);
                self.size = size;
                Ok(buffer.into())
            }
        }
    }

    pub fn get(&self, size: u64) -> Option<hal::GenericBufferPiece<D::Buffer>> {
        match self.buffer {
            Some(buffer) if self.size >= size => Some(buffer.into()),
            _ => None,
        }
    }

    pub fn destroy(&mut self, gpu: &D) {
        if let Some(buffer) = self.buffer.take() {
            gpu.destroy_buffer(buffer);
        }
        self.size = 0;
    }
}
