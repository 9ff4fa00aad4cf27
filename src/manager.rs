use blade_accel_hal::{self as hal, AccelerationStructureEncoder as _};
use std::{collections::HashMap, sync::Arc};

use crate::{
    blas::{BlasBuilder, BuildStats},
    config::Config,
    geometry::{AabbBatch, GeometryInput, GeometryInputBuilder},
    instance::{Instance, InstanceArena, InstanceHandle},
    resource::AccelerationStructure,
    scene::Scene,
    scratch::PersistentScratch,
    tlas::TlasBuilder,
    Error,
};

/// Procedural boxes of the loaded scene, kept for refitting.
struct Procedural<B> {
    batch: AabbBatch,
    buffer: B,
    flags: hal::AccelerationStructureFlags,
}

/// Owner of every acceleration structure of a scene.
///
/// Loads replace the whole scene. The previous structures stay alive
/// until the new ones are built, so a failed load leaves the last good
/// scene in place.
pub struct AsResourceManager<D: hal::Device> {
    gpu: Arc<D>,
    config: Config,
    bottom_levels: Vec<AccelerationStructure<D>>,
    tlas: TlasBuilder<D>,
    instances: InstanceArena,
    /// Instances were added or removed since the last top-level build.
    topology_changed: bool,
    procedural: Option<Procedural<D::Buffer>>,
    refit_scratch: PersistentScratch<D>,
    encoder: D::CommandEncoder,
    last_update: Option<D::SyncPoint>,
    stats: BuildStats,
}

impl<D: hal::Device> AsResourceManager<D> {
    pub fn new(gpu: Arc<D>, config: Config) -> Self {
        let encoder = gpu.create_command_encoder(hal::CommandEncoderDesc {
            name: "acceleration structure updates",
            buffer_count: 2,
        });
        Self {
            gpu,
            config,
            bottom_levels: Vec::new(),
            tlas: TlasBuilder::new(),
            instances: InstanceArena::new(),
            topology_changed: false,
            procedural: None,
            refit_scratch: PersistentScratch::new(),
            encoder,
            last_update: None,
            stats: BuildStats::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn wait_for_updates(&mut self) {
        if let Some(sp) = self.last_update.take() {
            if !self.gpu.wait_for(&sp, !0) {
                log::error!("Timed out waiting for the top-level update");
            }
        }
    }

    /// Build the structures of a mesh scene, replacing the current one.
    ///
    /// Every referenced mesh gets one bottom-level structure, and every
    /// drawable node gets one instance with the mesh index as its custom
    /// index. Returns instance handles in node order.
    #[profiling::function]
    pub fn load_scene(&mut self, scene: &Scene<D::Buffer>) -> Result<Vec<InstanceHandle>, Error> {
        let drawable = scene.drawable_nodes().collect::<Vec<_>>();
        let mask = self.config.instance_mask;
        let (inputs, instances) = if drawable.is_empty() {
            (Vec::new(), Vec::new())
        } else if self.config.pre_transform {
            let input = GeometryInputBuilder::build_from_mesh(scene, 0..scene.nodes.len(), true)?;
            let instance = Instance {
                mask,
                ..Instance::new(0, hal::IDENTITY_TRANSFORM)
            };
            (vec![input], vec![instance])
        } else {
            let mut mesh_indices = Vec::new();
            let mut blas_of_mesh = HashMap::new();
            for &(_, _, mesh) in drawable.iter() {
                blas_of_mesh.entry(mesh).or_insert_with(|| {
                    mesh_indices.push(mesh);
                    mesh_indices.len() as u32 - 1
                });
            }
            let inputs = GeometryInputBuilder::build_from_meshes(scene, &mesh_indices)?;
            let instances = drawable
                .iter()
                .map(|&(_, node, mesh)| Instance {
                    transform: node.transform,
                    blas_index: blas_of_mesh[&mesh],
                    custom_index: mesh as u32,
                    mask,
                    flags: 0,
                })
                .collect();
            (inputs, instances)
        };
        log::info!(
            "Loading scene with {} nodes: {} bottom-level structures, {} instances",
            scene.nodes.len(),
            inputs.len(),
            instances.len()
        );
        let flags = self.config.bottom_level_flags();
        self.replace(inputs, instances, flags, None)
    }

    /// Build the structures of a procedural scene, replacing the current one.
    ///
    /// Boxes sharing a bottom-level index end up in one structure with a
    /// single identity instance. Returns instance handles in ascending
    /// bottom-level index order.
    #[profiling::function]
    pub fn load_aabbs(
        &mut self,
        aabbs: &[hal::Aabb],
        blas_indices: &[u32],
        allow_updating: bool,
    ) -> Result<Vec<InstanceHandle>, Error> {
        let batch = GeometryInputBuilder::build_from_aabbs(aabbs, blas_indices)?;
        let flags = self.config.procedural_flags(allow_updating);
        if batch.is_empty() {
            return self.replace(Vec::new(), Vec::new(), flags, None);
        }

        let buffer = self
            .gpu
            .create_buffer(hal::BufferDesc {
                name: "procedural boxes",
                size: (batch.packed().len() * size_of::<hal::Aabb>()) as u64,
                memory: hal::Memory::Shared,
            })
            .map_err(|e| Error::build_failure("procedural boxes", e))?;
        self.gpu
            .write_buffer(buffer.into(), bytemuck::cast_slice(batch.packed()));

        let inputs = batch.inputs(buffer, hal::AccelerationStructureFlags::empty());
        let instances = batch
            .groups()
            .iter()
            .enumerate()
            .map(|(position, group)| Instance {
                custom_index: group.blas_index,
                mask: self.config.instance_mask,
                ..Instance::new(position as u32, hal::IDENTITY_TRANSFORM)
            })
            .collect();
        log::info!(
            "Loading {} boxes in {} procedural groups",
            aabbs.len(),
            batch.groups().len()
        );
        self.replace(
            inputs,
            instances,
            flags,
            Some(Procedural {
                batch,
                buffer,
                flags,
            }),
        )
    }

    fn replace(
        &mut self,
        inputs: Vec<GeometryInput<D::Buffer>>,
        instances: Vec<Instance>,
        flags: hal::AccelerationStructureFlags,
        procedural: Option<Procedural<D::Buffer>>,
    ) -> Result<Vec<InstanceHandle>, Error> {
        self.wait_for_updates();
        let gpu = &*self.gpu;

        let built = BlasBuilder::new(gpu, &self.config)
            .build(&inputs, flags)
            .and_then(|batch| {
                match self
                    .tlas
                    .build(gpu, &instances, &batch.structures, self.config.top_level_flags())
                {
                    Ok(()) => Ok(batch),
                    Err(e) => {
                        for structure in batch.structures {
                            structure.destroy(gpu);
                        }
                        Err(e)
                    }
                }
            });
        let batch = match built {
            Ok(batch) => batch,
            Err(e) => {
                if let Some(procedural) = procedural {
                    gpu.destroy_buffer(procedural.buffer);
                }
                log::error!("Scene load failed, keeping the previous scene: {}", e);
                return Err(e);
            }
        };

        // The new top level no longer references the old structures.
        for structure in self.bottom_levels.drain(..) {
            structure.destroy(gpu);
        }
        if let Some(old) = self.procedural.take() {
            gpu.destroy_buffer(old.buffer);
        }
        self.bottom_levels = batch.structures;
        self.procedural = procedural;
        self.stats = batch.stats;
        self.topology_changed = false;
        self.instances.clear();
        Ok(instances
            .into_iter()
            .map(|instance| self.instances.insert(instance))
            .collect())
    }

    fn transforms(&self) -> Vec<hal::Transform> {
        self.instances
            .iter()
            .map(|(_, instance)| instance.transform)
            .collect()
    }

    /// Record and submit an in-place update of the top level from the
    /// current instance transforms.
    ///
    /// On failure the instances are moved back to `previous`, in instance
    /// order, and the instance buffer is rewritten to match the device.
    fn update_top_level(&mut self, previous: Vec<hal::Transform>) -> Result<(), Error> {
        let instances = self.instances.to_vec();
        self.wait_for_updates();
        self.encoder.start();
        let gpu = &*self.gpu;
        let submitted = self
            .tlas
            .update(gpu, &mut self.encoder, &instances)
            .and_then(|()| {
                gpu.submit(&mut self.encoder)
                    .map_err(|e| Error::build_failure("TLAS update", e))
            });
        match submitted {
            Ok(sync_point) => {
                self.last_update = Some(sync_point);
                Ok(())
            }
            Err(e) => {
                log::warn!("Top-level update failed, restoring transforms: {}", e);
                for (instance, transform) in self.instances.iter_mut().zip(previous) {
                    instance.transform = transform;
                }
                let restored = self.instances.to_vec();
                self.tlas.write_transforms(gpu, &restored);
                Err(e)
            }
        }
    }

    fn check_update(&self) -> Result<(), Error> {
        if self.topology_changed {
            return Err(Error::InvalidUpdate(
                "instances were added or removed since the last top-level build".to_string(),
            ));
        }
        self.tlas.check_update(&self.instances.to_vec())
    }

    /// Move individual instances.
    ///
    /// Nothing is changed if any handle is stale or the top level can't
    /// be updated.
    #[profiling::function]
    pub fn update_blas_transforms(
        &mut self,
        transforms: &[(InstanceHandle, hal::Transform)],
    ) -> Result<(), Error> {
        self.check_update()?;
        for &(handle, _) in transforms {
            self.instances.get(handle)?;
        }
        let previous = self.transforms();
        for &(handle, ref transform) in transforms {
            self.instances.get_mut(handle)?.transform = *transform;
        }
        self.update_top_level(previous)
    }

    /// Set the transforms of all instances, in instance order.
    #[profiling::function]
    pub fn update_instance_transforms(&mut self, transforms: &[hal::Transform]) -> Result<(), Error> {
        if transforms.len() != self.instances.len() {
            return Err(Error::InvalidUpdate(format!(
                "{} transforms are given for {} instances",
                transforms.len(),
                self.instances.len()
            )));
        }
        self.check_update()?;
        let previous = self.transforms();
        for (instance, transform) in self.instances.iter_mut().zip(transforms) {
            instance.transform = *transform;
        }
        self.update_top_level(previous)
    }

    /// Move the boxes of a procedural scene loaded with `allow_updating`.
    ///
    /// Boxes are given in the order they were loaded in.
    #[profiling::function]
    pub fn refit_aabbs(&mut self, aabbs: &[hal::Aabb]) -> Result<(), Error> {
        let (packed, buffer, flags) = match self.procedural {
            Some(ref procedural)
                if procedural
                    .flags
                    .contains(hal::AccelerationStructureFlags::ALLOW_UPDATE) =>
            {
                (procedural.batch.pack(aabbs)?, procedural.buffer, procedural.flags)
            }
            Some(_) => {
                return Err(Error::InvalidUpdate(
                    "procedural scene was loaded without update support".to_string(),
                ))
            }
            None => {
                return Err(Error::InvalidUpdate(
                    "no procedural scene is loaded".to_string(),
                ))
            }
        };
        if self.topology_changed {
            return Err(Error::InvalidUpdate(
                "instances were added or removed since the last top-level build".to_string(),
            ));
        }
        self.wait_for_updates();

        let gpu = &*self.gpu;
        gpu.write_buffer(buffer.into(), bytemuck::cast_slice(&packed));
        let inputs = match self.procedural {
            Some(ref procedural) => procedural
                .batch
                .inputs(buffer, hal::AccelerationStructureFlags::empty()),
            None => Vec::new(),
        };
        BlasBuilder::new(gpu, &self.config).refit(
            &self.bottom_levels,
            &inputs,
            flags,
            &mut self.refit_scratch,
        )?;
        // Instance bounds have moved with the boxes.
        if self
            .tlas
            .flags()
            .contains(hal::AccelerationStructureFlags::ALLOW_UPDATE)
        {
            let current = self.transforms();
            self.update_top_level(current)
        } else {
            self.rebuild_top_level()
        }
    }

    /// Add an instance of an already built bottom-level structure.
    /// Takes effect after [`Self::rebuild_top_level`].
    pub fn add_instance(&mut self, instance: Instance) -> Result<InstanceHandle, Error> {
        if instance.blas_index as usize >= self.bottom_levels.len() {
            return Err(Error::InvalidInstance {
                index: self.instances.len(),
                blas_index: instance.blas_index,
            });
        }
        if instance.custom_index > hal::InstanceDesc::MAX_CUSTOM_INDEX {
            return Err(Error::InvalidCustomIndex {
                index: self.instances.len(),
                custom_index: instance.custom_index,
            });
        }
        self.topology_changed = true;
        Ok(self.instances.insert(instance))
    }

    /// Remove an instance. Takes effect after [`Self::rebuild_top_level`].
    pub fn remove_instance(&mut self, handle: InstanceHandle) -> Result<Instance, Error> {
        let instance = self.instances.remove(handle)?;
        self.topology_changed = true;
        Ok(instance)
    }

    /// Fully rebuild the top level over the current instances.
    #[profiling::function]
    pub fn rebuild_top_level(&mut self) -> Result<(), Error> {
        self.wait_for_updates();
        let instances = self.instances.to_vec();
        self.tlas.build(
            &*self.gpu,
            &instances,
            &self.bottom_levels,
            self.config.top_level_flags(),
        )?;
        self.topology_changed = false;
        Ok(())
    }

    pub fn instance(&self, handle: InstanceHandle) -> Result<&Instance, Error> {
        self.instances.get(handle)
    }

    /// Handle to bind for ray tracing. Stays valid until the next load
    /// or rebuild.
    pub fn top_level_handle(&self) -> Option<D::AccelerationStructure> {
        self.tlas.handle()
    }

    pub fn top_level(&self) -> &TlasBuilder<D> {
        &self.tlas
    }

    pub fn bottom_level_count(&self) -> usize {
        self.bottom_levels.len()
    }

    pub fn bottom_levels(&self) -> &[AccelerationStructure<D>] {
        &self.bottom_levels
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn last_build_stats(&self) -> &BuildStats {
        &self.stats
    }

    /// Wait for the last submitted update to finish.
    pub fn wait_idle(&mut self) {
        self.wait_for_updates();
    }
}

impl<D: hal::Device> Drop for AsResourceManager<D> {
    fn drop(&mut self) {
        self.wait_for_updates();
        let gpu = &*self.gpu;
        self.tlas.destroy(gpu);
        for structure in self.bottom_levels.drain(..) {
            structure.destroy(gpu);
        }
        if let Some(procedural) = self.procedural.take() {
            gpu.destroy_buffer(procedural.buffer);
        }
        self.refit_scratch.destroy(gpu);
        gpu.destroy_command_encoder(&mut self.encoder);
        log::debug!("Released all acceleration structures");
    }
}
