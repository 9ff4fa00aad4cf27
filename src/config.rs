use blade_accel_hal as hal;
use std::{fs, path::Path};

#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Deserialize)]
pub enum TracePreference {
    #[default]
    FastTrace,
    FastBuild,
}

fn default_batch_memory_budget() -> u64 {
    256 << 20
}
fn default_max_batch_size() -> usize {
    64
}
fn default_true() -> bool {
    true
}
fn default_instance_mask() -> u8 {
    0xFF
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trace_preference: TracePreference,
    /// Shrink bottom-level structures after they are built.
    #[serde(default = "default_true")]
    pub compaction: bool,
    /// Summed uncompacted size after which a bottom-level batch is flushed.
    #[serde(default = "default_batch_memory_budget")]
    pub batch_memory_budget: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Build the top level with update support, so that moving
    /// instances doesn't require a rebuild.
    #[serde(default = "default_true")]
    pub top_level_updates: bool,
    /// Merge the whole scene into a single bottom-level structure,
    /// baking node transforms into the geometry.
    #[serde(default)]
    pub pre_transform: bool,
    #[serde(default = "default_instance_mask")]
    pub instance_mask: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace_preference: TracePreference::default(),
            compaction: default_true(),
            batch_memory_budget: default_batch_memory_budget(),
            max_batch_size: default_max_batch_size(),
            top_level_updates: default_true(),
            pre_transform: false,
            instance_mask: default_instance_mask(),
        }
    }
}

impl Config {
    pub fn from_ron(text: &str) -> Result<Self, crate::Error> {
        Ok(ron::de::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, crate::Error> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_ron(&text)?;
        log::info!("Loaded {:?} from {}", config, path.display());
        Ok(config)
    }

    fn preference_flags(&self) -> hal::AccelerationStructureFlags {
        match self.trace_preference {
            TracePreference::FastTrace => hal::AccelerationStructureFlags::PREFER_FAST_TRACE,
            TracePreference::FastBuild => hal::AccelerationStructureFlags::PREFER_FAST_BUILD,
        }
    }

    /// Flags for bottom-level builds of static geometry.
    pub fn bottom_level_flags(&self) -> hal::AccelerationStructureFlags {
        let mut flags = self.preference_flags();
        if self.compaction {
            flags |= hal::AccelerationStructureFlags::ALLOW_COMPACTION;
        }
        flags
    }

    /// Flags for bottom-level builds of procedural boxes. Refittable
    /// structures are not compacted.
    pub fn procedural_flags(&self, allow_updating: bool) -> hal::AccelerationStructureFlags {
        if allow_updating {
            self.preference_flags() | hal::AccelerationStructureFlags::ALLOW_UPDATE
        } else {
            self.bottom_level_flags()
        }
    }

    pub fn top_level_flags(&self) -> hal::AccelerationStructureFlags {
        let mut flags = self.preference_flags();
        if self.top_level_updates {
            flags |= hal::AccelerationStructureFlags::ALLOW_UPDATE;
        }
        flags
    }
}

#[test]
fn parse_partial() {
    let config = Config::from_ron("(compaction: false, trace_preference: FastBuild)").unwrap();
    assert!(!config.compaction);
    assert_eq!(config.trace_preference, TracePreference::FastBuild);
    assert_eq!(config.batch_memory_budget, 256 << 20);
    assert_eq!(config.instance_mask, 0xFF);
    assert!(!config
        .bottom_level_flags()
        .contains(hal::AccelerationStructureFlags::ALLOW_COMPACTION));
}
