use blade_accel_hal as hal;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or empty geometry input. The whole batch is rejected.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// The device rejected a build. Nothing from the failed call is kept.
    #[error("failed to build '{name}'")]
    BuildFailure {
        name: String,
        #[source]
        source: hal::DeviceError,
    },
    /// An update was requested that would change the structure topology.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    /// An instance references a bottom-level structure that is not built.
    #[error("instance {index} references missing bottom-level structure {blas_index}")]
    InvalidInstance { index: usize, blas_index: u32 },
    #[error("instance {index} has custom index {custom_index}, which does not fit into 24 bits")]
    InvalidCustomIndex { index: usize, custom_index: u32 },
    #[error("instance handle {0:?} is stale")]
    StaleInstance(crate::InstanceHandle),
    #[error("unable to read configuration")]
    ConfigIo(#[from] std::io::Error),
    #[error("unable to parse configuration")]
    Config(#[from] ron::error::SpannedError),
}

impl Error {
    pub(crate) fn build_failure(name: &str, source: hal::DeviceError) -> Self {
        Self::BuildFailure {
            name: name.to_string(),
            source,
        }
    }
}
