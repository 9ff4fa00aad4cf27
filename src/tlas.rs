use blade_accel_hal::{self as hal, AccelerationStructureEncoder as _};

use crate::{
    instance::Instance,
    resource::{one_off, AccelerationStructure},
    scratch::PersistentScratch,
    Error,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TlasState {
    Empty,
    Built,
    /// A full build is in progress. The previous structure stays valid
    /// until it completes.
    Rebuilding,
}

/// Owner of the top-level structure and its instance buffer.
pub struct TlasBuilder<D: hal::Device> {
    state: TlasState,
    flags: hal::AccelerationStructureFlags,
    structure: Option<AccelerationStructure<D>>,
    instance_buffer: Option<D::Buffer>,
    /// Host copy of the instance buffer contents.
    records: Vec<hal::InstanceDesc>,
    /// Bottom-level index of every instance at the last build.
    topology: Vec<u32>,
    update_scratch: PersistentScratch<D>,
    update_scratch_size: u64,
}

struct Built<D: hal::Device> {
    structure: AccelerationStructure<D>,
    instance_buffer: D::Buffer,
    update_scratch_size: u64,
}

impl<D: hal::Device> TlasBuilder<D> {
    pub fn new() -> Self {
        Self {
            state: TlasState::Empty,
            flags: hal::AccelerationStructureFlags::empty(),
            structure: None,
            instance_buffer: None,
            records: Vec::new(),
            topology: Vec::new(),
            update_scratch: PersistentScratch::new(),
            update_scratch_size: 0,
        }
    }

    pub fn state(&self) -> TlasState {
        self.state
    }

    pub fn flags(&self) -> hal::AccelerationStructureFlags {
        self.flags
    }

    pub fn handle(&self) -> Option<D::AccelerationStructure> {
        self.structure.as_ref().map(|s| s.raw())
    }

    pub fn structure(&self) -> Option<&AccelerationStructure<D>> {
        self.structure.as_ref()
    }

    pub fn instance_buffer(&self) -> Option<D::Buffer> {
        self.instance_buffer
    }

    pub fn instance_count(&self) -> usize {
        self.records.len()
    }

    /// Build a new top-level structure over `instances`.
    ///
    /// The bottom-level structures must be built and waited on. On failure
    /// the previous structure is kept as it was.
    #[profiling::function]
    pub fn build(
        &mut self,
        gpu: &D,
        instances: &[Instance],
        blases: &[AccelerationStructure<D>],
        flags: hal::AccelerationStructureFlags,
    ) -> Result<(), Error> {
        let mut records = Vec::with_capacity(instances.len());
        for (index, instance) in instances.iter().enumerate() {
            if instance.custom_index > hal::InstanceDesc::MAX_CUSTOM_INDEX {
                return Err(Error::InvalidCustomIndex {
                    index,
                    custom_index: instance.custom_index,
                });
            }
            let blas = blases
                .get(instance.blas_index as usize)
                .ok_or(Error::InvalidInstance {
                    index,
                    blas_index: instance.blas_index,
                })?;
            records.push(hal::InstanceDesc::new(
                &instance.transform,
                instance.custom_index,
                instance.mask,
                instance.flags,
                blas.device_address(),
            ));
        }

        let previous = self.state;
        self.state = TlasState::Rebuilding;
        let built = match self.build_new(gpu, &records, flags) {
            Ok(built) => built,
            Err(e) => {
                self.state = previous;
                return Err(e);
            }
        };

        self.release(gpu);
        self.structure = Some(built.structure);
        self.instance_buffer = Some(built.instance_buffer);
        self.update_scratch_size = built.update_scratch_size;
        self.topology = instances.iter().map(|i| i.blas_index).collect();
        self.records = records;
        self.flags = flags;
        self.state = TlasState::Built;
        log::info!(
            "Built top-level structure with {} instances",
            self.records.len()
        );
        Ok(())
    }

    fn build_new(
        &mut self,
        gpu: &D,
        records: &[hal::InstanceDesc],
        flags: hal::AccelerationStructureFlags,
    ) -> Result<Built<D>, Error> {
        let count = records.len() as u32;
        let sizes = gpu
            .get_top_level_acceleration_structure_sizes(count, flags)
            .map_err(|e| Error::build_failure("TLAS", e))?;
        let structure = AccelerationStructure::create(
            gpu,
            "TLAS",
            hal::AccelerationStructureType::TopLevel,
            sizes.data,
        )
        .map_err(|e| Error::build_failure("TLAS", e))?;
        let instance_buffer = match gpu.create_buffer(hal::BufferDesc {
            name: "TLAS instances",
            size: (count as u64).max(1) * hal::InstanceDesc::SIZE,
            memory: hal::Memory::Shared,
        }) {
            Ok(buffer) => buffer,
            Err(e) => {
                structure.destroy(gpu);
                return Err(Error::build_failure("TLAS instances", e));
            }
        };
        gpu.write_buffer(instance_buffer.into(), bytemuck::cast_slice(records));

        let result = gpu
            .create_buffer(hal::BufferDesc {
                name: "TLAS scratch",
                size: sizes.scratch,
                memory: hal::Memory::Device,
            })
            .and_then(|scratch| {
                let result = if flags.contains(hal::AccelerationStructureFlags::ALLOW_UPDATE) {
                    self.update_scratch
                        .ensure(gpu, sizes.update_scratch)
                        .map(|_| ())
                } else {
                    Ok(())
                }
                .and_then(|()| {
                    one_off(gpu, "TLAS build", |encoder| {
                        encoder.build_top_level(
                            structure.raw(),
                            count,
                            instance_buffer.into(),
                            flags,
                            hal::BuildMode::Build,
                            scratch.into(),
                        );
                    })
                });
                gpu.destroy_buffer(scratch);
                result
            });

        match result {
            Ok(()) => Ok(Built {
                structure,
                instance_buffer,
                update_scratch_size: sizes.update_scratch,
            }),
            Err(e) => {
                structure.destroy(gpu);
                gpu.destroy_buffer(instance_buffer);
                Err(Error::build_failure("TLAS", e))
            }
        }
    }

    /// Check that `instances` only differ from the last build in their
    /// transforms.
    pub fn check_update(&self, instances: &[Instance]) -> Result<(), Error> {
        if self.state != TlasState::Built {
            return Err(Error::InvalidUpdate(format!(
                "top-level structure is {:?}",
                self.state
            )));
        }
        if !self
            .flags
            .contains(hal::AccelerationStructureFlags::ALLOW_UPDATE)
        {
            return Err(Error::InvalidUpdate(
                "top-level structure is not built for updates".to_string(),
            ));
        }
        if instances.len() != self.topology.len() {
            return Err(Error::InvalidUpdate(format!(
                "instance count changed from {} to {}",
                self.topology.len(),
                instances.len()
            )));
        }
        let changed = instances
            .iter()
            .zip(self.topology.iter())
            .position(|(instance, &blas_index)| instance.blas_index != blas_index);
        match changed {
            Some(index) => Err(Error::InvalidUpdate(format!(
                "instance {} moved from bottom-level structure {} to {}",
                index, self.topology[index], instances[index].blas_index
            ))),
            None => Ok(()),
        }
    }

    /// Record an in-place update with new instance transforms.
    ///
    /// Only the transforms are taken from `instances`. The device must be
    /// done with any previous update before this is called.
    pub fn update(
        &mut self,
        gpu: &D,
        encoder: &mut D::CommandEncoder,
        instances: &[Instance],
    ) -> Result<(), Error> {
        self.check_update(instances)?;
        let (structure, instance_buffer) = match (self.structure.as_ref(), self.instance_buffer) {
            (Some(structure), Some(buffer)) => (structure.raw(), buffer),
            _ => {
                return Err(Error::InvalidUpdate(
                    "top-level structure has no storage".to_string(),
                ))
            }
        };
        let scratch = self
            .update_scratch
            .get(self.update_scratch_size)
            .ok_or_else(|| Error::InvalidUpdate("update scratch is not allocated".to_string()))?;

        self.write_transforms(gpu, instances);
        encoder.build_top_level(
            structure,
            self.records.len() as u32,
            instance_buffer.into(),
            self.flags,
            hal::BuildMode::Update,
            scratch,
        );
        log::trace!("Recorded top-level update of {} instances", self.records.len());
        Ok(())
    }

    /// Copy instance transforms into the mirrored records and the instance
    /// buffer. Also used to roll back an update that failed to submit.
    pub fn write_transforms(&mut self, gpu: &D, instances: &[Instance]) {
        let instance_buffer = match self.instance_buffer {
            Some(buffer) => buffer,
            None => return,
        };
        for (record, instance) in self.records.iter_mut().zip(instances) {
            record.transform = hal::transform_to_rows(&instance.transform);
        }
        gpu.write_buffer(instance_buffer.into(), bytemuck::cast_slice(&self.records));
    }

    fn release(&mut self, gpu: &D) {
        if let Some(structure) = self.structure.take() {
            structure.destroy(gpu);
        }
        if let Some(buffer) = self.instance_buffer.take() {
            gpu.destroy_buffer(buffer);
        }
    }

    /// Release everything, returning to the empty state.
    pub fn destroy(&mut self, gpu: &D) {
        self.release(gpu);
        self.update_scratch.destroy(gpu);
        self.records.clear();
        self.topology.clear();
        self.state = TlasState::Empty;
    }
}
