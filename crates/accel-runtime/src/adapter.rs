//! Adapter discovery and selection.
//!
//! A [`DeviceProvider`] enumerates the adapters of one driver stack and opens devices on
//! them. [`select_adapter`] implements the selection policy shared by every provider.

use log::info;

use crate::{
    device::{ComputeDevice, DeviceError},
    error::EngineError,
};

/// Capabilities an adapter advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterAttributes {
    /// Supports general compute work.
    pub core_compute: bool,
    /// Supports machine-learning operators, including on dedicated ML accelerators.
    pub generic_ml: bool,
}

/// The minimum capability level a device is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureLevel {
    /// Compute-only devices.
    CoreCompute1_0,
    /// Devices exposing machine-learning operators.
    GenericMl1_0,
}

impl std::fmt::Display for FeatureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureLevel::CoreCompute1_0 => write!(f, "CORE_COMPUTE_1_0"),
            FeatureLevel::GenericMl1_0 => write!(f, "GENERIC_ML_1_0"),
        }
    }
}

/// Description of an enumerated adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// The driver description.
    pub description: String,
    /// Advertised capabilities.
    pub attributes: AdapterAttributes,
    /// False for software rasterizers and emulators.
    pub hardware: bool,
    /// True for adapters preferred for heavy workloads, such as discrete GPUs.
    pub high_performance: bool,
}

impl AdapterInfo {
    /// Returns the description tagged with the advertised capabilities.
    pub fn tagged_description(&self) -> String {
        let mut description = self.description.trim_end_matches('\0').to_string();
        if self.attributes.core_compute {
            description.push_str(" (CORE_COMPUTE)");
        }
        if self.attributes.generic_ml {
            description.push_str(" (GENERIC_ML)");
        }
        description
    }
}

/// Enumerates adapters and opens devices for one driver stack.
pub trait DeviceProvider {
    /// Lists the adapters visible to this provider, in enumeration order.
    fn enumerate_adapters(&self) -> Result<Vec<AdapterInfo>, DeviceError>;

    /// Opens a device on the adapter at `index` of [`DeviceProvider::enumerate_adapters`].
    ///
    /// # Arguments
    ///
    /// * `index` - The adapter index
    /// * `level` - The feature level the device must support
    /// * `debug` - Enables driver validation layers when available
    fn create_device(
        &self,
        index: usize,
        level: FeatureLevel,
        debug: bool,
    ) -> Result<Box<dyn ComputeDevice>, DeviceError>;
}

/// The adapter picked by [`select_adapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSelection {
    /// Index into the enumerated adapters.
    pub index: usize,
    /// The feature level to create the device with.
    pub feature_level: FeatureLevel,
    /// The tagged description of the adapter.
    pub description: String,
}

/// Pick an adapter by capability, preference and name.
///
/// Machine-learning capable adapters are considered first. If there are none, compute
/// capable adapters are considered instead with a lower feature level. Candidates are
/// ordered hardware first, then high-performance first, and the first one whose tagged
/// description contains `name_filter` is chosen. An empty filter matches every adapter.
///
/// # Errors
///
/// Returns [`EngineError::DeviceAcquisition`] if no adapter is compatible or none matches
/// the filter.
pub fn select_adapter(
    adapters: &[AdapterInfo],
    name_filter: &str,
) -> Result<AdapterSelection, EngineError> {
    let mut feature_level = FeatureLevel::GenericMl1_0;
    let mut candidates: Vec<usize> = (0..adapters.len())
        .filter(|&i| adapters[i].attributes.generic_ml)
        .collect();

    if candidates.is_empty() {
        info!("No GENERIC_ML adapters found. Falling back to CORE_COMPUTE.");
        feature_level = FeatureLevel::CoreCompute1_0;
        candidates = (0..adapters.len())
            .filter(|&i| adapters[i].attributes.core_compute)
            .collect();
    }

    if candidates.is_empty() {
        return Err(EngineError::DeviceAcquisition(
            "no compatible adapters found".into(),
        ));
    }

    // stable: enumeration order breaks ties
    candidates.sort_by_key(|&i| (!adapters[i].hardware, !adapters[i].high_performance));

    let mut selected = None;
    for (rank, &i) in candidates.iter().enumerate() {
        let description = adapters[i].tagged_description();
        if selected.is_none() && description.contains(name_filter) {
            info!("Adapter[{rank}]: {description} (SELECTED)");
            selected = Some(AdapterSelection {
                index: i,
                feature_level,
                description,
            });
        } else {
            info!("Adapter[{rank}]: {description}");
        }
    }

    let selection = selected.ok_or_else(|| {
        EngineError::DeviceAcquisition("no adapters match the provided name filter".into())
    })?;
    info!(
        "Selected adapter: {} index: {} feature level: {}",
        selection.description, selection.index, selection.feature_level
    );
    Ok(selection)
}

/// Select an adapter from `provider` and open a device on it.
///
/// # Errors
///
/// Returns [`EngineError::DeviceAcquisition`] if enumeration, selection or device creation
/// fails.
pub fn acquire_device(
    provider: &dyn DeviceProvider,
    name_filter: &str,
    debug: bool,
) -> Result<Box<dyn ComputeDevice>, EngineError> {
    let adapters = provider
        .enumerate_adapters()
        .map_err(|e| EngineError::DeviceAcquisition(e.to_string()))?;
    let selection = select_adapter(&adapters, name_filter)?;
    let device = provider
        .create_device(selection.index, selection.feature_level, debug)
        .map_err(|e| EngineError::DeviceAcquisition(e.to_string()))?;
    info!("Device created on {}", device.kind());
    Ok(device)
}
