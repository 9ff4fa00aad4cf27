use std::{fmt::Debug, hash::Hash};

use super::{
    AccelerationStructureDesc, AccelerationStructureFlags, AccelerationStructureGeometry,
    AccelerationStructureSizes, BufferDesc, BuildMode, CommandEncoderDesc, DeviceError,
    GenericBufferPiece, QueryPoolDesc,
};

pub trait BufferHandle: Send + Sync + Clone + Copy + Debug + Hash + PartialEq {
    fn at(self, offset: u64) -> GenericBufferPiece<Self> {
        GenericBufferPiece {
            buffer: self,
            offset,
        }
    }
}

pub trait ResourceDevice {
    type Buffer: BufferHandle;
    type AccelerationStructure: Send + Sync + Clone + Copy + Debug + Hash + PartialEq;

    fn create_buffer(&self, desc: BufferDesc) -> Result<Self::Buffer, DeviceError>;
    fn destroy_buffer(&self, buffer: Self::Buffer);
    /// Copy `data` into a host-visible buffer.
    fn write_buffer(&self, dst: GenericBufferPiece<Self::Buffer>, data: &[u8]);
    /// Copy host-visible buffer contents into `data`.
    fn read_buffer(&self, src: GenericBufferPiece<Self::Buffer>, data: &mut [u8]);
    fn buffer_device_address(&self, buffer: Self::Buffer) -> u64;

    fn get_bottom_level_acceleration_structure_sizes(
        &self,
        geometries: &[AccelerationStructureGeometry<Self::Buffer>],
        flags: AccelerationStructureFlags,
    ) -> Result<AccelerationStructureSizes, DeviceError>;
    fn get_top_level_acceleration_structure_sizes(
        &self,
        instance_count: u32,
        flags: AccelerationStructureFlags,
    ) -> Result<AccelerationStructureSizes, DeviceError>;
    fn create_acceleration_structure(
        &self,
        desc: AccelerationStructureDesc<Self::Buffer>,
    ) -> Result<Self::AccelerationStructure, DeviceError>;
    fn destroy_acceleration_structure(&self, acceleration_structure: Self::AccelerationStructure);
    fn acceleration_structure_device_address(
        &self,
        acceleration_structure: Self::AccelerationStructure,
    ) -> u64;
}

pub trait QueryDevice: ResourceDevice {
    type QueryPool: Send + Sync + Clone + Copy + Debug;

    fn create_query_pool(&self, desc: QueryPoolDesc) -> Result<Self::QueryPool, DeviceError>;
    fn destroy_query_pool(&self, pool: Self::QueryPool);
    /// Read back the first `count` results. Only valid after the writing
    /// submission has been waited on.
    fn get_query_pool_results(
        &self,
        pool: Self::QueryPool,
        count: u32,
    ) -> Result<Vec<u64>, DeviceError>;
}

pub trait AccelerationStructureEncoder {
    type Buffer: BufferHandle;
    type AccelerationStructure: Send + Sync + Clone + Copy + Debug;
    type QueryPool: Send + Sync + Clone + Copy + Debug;

    fn start(&mut self);

    fn build_bottom_level(
        &mut self,
        acceleration_structure: Self::AccelerationStructure,
        geometries: &[AccelerationStructureGeometry<Self::Buffer>],
        flags: AccelerationStructureFlags,
        mode: BuildMode,
        scratch_data: GenericBufferPiece<Self::Buffer>,
    );

    fn build_top_level(
        &mut self,
        acceleration_structure: Self::AccelerationStructure,
        instance_count: u32,
        instance_data: GenericBufferPiece<Self::Buffer>,
        flags: AccelerationStructureFlags,
        mode: BuildMode,
        scratch_data: GenericBufferPiece<Self::Buffer>,
    );

    /// Write the post-build compacted size of each structure into
    /// consecutive queries starting at `first_query`.
    fn write_compacted_sizes(
        &mut self,
        acceleration_structures: &[Self::AccelerationStructure],
        pool: Self::QueryPool,
        first_query: u32,
    );

    fn copy_compacted(
        &mut self,
        src: Self::AccelerationStructure,
        dst: Self::AccelerationStructure,
    );

    /// Order all preceding acceleration structure work before the following.
    fn barrier(&mut self);
}

pub trait CommandDevice: QueryDevice {
    type CommandEncoder: AccelerationStructureEncoder<
        Buffer = Self::Buffer,
        AccelerationStructure = Self::AccelerationStructure,
        QueryPool = Self::QueryPool,
    >;
    type SyncPoint: Clone + Debug;

    fn create_command_encoder(&self, desc: CommandEncoderDesc) -> Self::CommandEncoder;
    fn destroy_command_encoder(&self, encoder: &mut Self::CommandEncoder);
    fn submit(&self, encoder: &mut Self::CommandEncoder) -> Result<Self::SyncPoint, DeviceError>;
    fn wait_for(&self, sp: &Self::SyncPoint, timeout_ms: u32) -> bool;
}

/// Everything the acceleration structure pipeline needs from a device.
pub trait Device: CommandDevice + Send + Sync {}
impl<T: CommandDevice + Send + Sync> Device for T {}
