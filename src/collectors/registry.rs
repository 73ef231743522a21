use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use crate::collectors::gpu::GpuTool;
use crate::metrics::{GpuIndex, GpuInfo};

/// Maps GPU uuids to stable device indices.
///
/// The device list is fetched once, on the first `resolve`, and kept until
/// `reset`. Devices that appear afterwards are never discovered.
pub struct GpuRegistry {
    tool: Arc<dyn GpuTool>,
    devices: RwLock<Option<Devices>>,
}

struct Devices {
    by_uuid: HashMap<String, GpuIndex>,
    gpus: Vec<GpuInfo>,
}

impl GpuRegistry {
    pub fn new(tool: Arc<dyn GpuTool>) -> Self {
        Self {
            tool,
            devices: RwLock::new(None),
        }
    }

    /// Returns the index of the GPU with `uuid`, listing devices on first use.
    ///
    /// Unknown uuids and a failed listing both resolve to `None`. A failed
    /// listing is retried on the next call.
    pub fn resolve(&self, uuid: &str) -> Option<GpuIndex> {
        {
            let devices = self.devices.read();
            if let Some(devices) = devices.as_ref() {
                return devices.by_uuid.get(uuid).copied();
            }
        }

        let mut devices = self.devices.write();
        // Another thread may have loaded the list while we waited.
        if devices.is_none() {
            match self.tool.list_gpus() {
                Ok(gpus) => {
                    debug!("{} reported {} GPU(s)", self.tool.name(), gpus.len());
                    let by_uuid = gpus.iter().map(|g| (g.uuid.clone(), g.index)).collect();
                    *devices = Some(Devices { by_uuid, gpus });
                }
                Err(e) => {
                    debug!("GPU listing failed: {}", e);
                    return None;
                }
            }
        }

        let index = devices.as_ref().and_then(|d| d.by_uuid.get(uuid).copied());
        if index.is_none() {
            debug!("GPU uuid {} is not in the device list", uuid);
        }
        index
    }

    /// Indices of all devices known so far, ascending. Empty until loaded.
    pub fn known_indices(&self) -> Vec<GpuIndex> {
        let mut indices: Vec<GpuIndex> = self
            .devices
            .read()
            .as_ref()
            .map(|d| d.by_uuid.values().copied().collect())
            .unwrap_or_default();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    pub fn devices(&self) -> Vec<GpuInfo> {
        self.devices
            .read()
            .as_ref()
            .map(|d| d.gpus.clone())
            .unwrap_or_default()
    }

    pub fn is_loaded(&self) -> bool {
        self.devices.read().is_some()
    }

    /// Drops the cached device list; the next `resolve` lists devices again.
    pub fn reset(&self) {
        *self.devices.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::gpu::{ComputeApps, parse_gpu_list};
    use crate::error::ToolError;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ListingTool {
        output: &'static str,
        listings: AtomicUsize,
        fail: bool,
    }

    impl ListingTool {
        fn new(output: &'static str) -> Arc<Self> {
            Arc::new(Self { output, listings: AtomicUsize::new(0), fail: false })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self { output: "", listings: AtomicUsize::new(0), fail: true })
        }

        fn listings(&self) -> usize {
            self.listings.load(Ordering::SeqCst)
        }
    }

    impl GpuTool for ListingTool {
        fn name(&self) -> &str {
            "listing-tool"
        }

        fn list_gpus(&self) -> Result<Vec<GpuInfo>, ToolError> {
            self.listings.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ToolError::Unavailable {
                    tool: "listing-tool".to_string(),
                    source: io::Error::from(io::ErrorKind::NotFound),
                });
            }
            Ok(parse_gpu_list(self.output))
        }

        fn compute_apps(&self) -> Result<ComputeApps, ToolError> {
            Ok(ComputeApps::default())
        }
    }

    const THREE_GPUS: &str = "\
GPU 2: Tesla V100-PCIE-32GB (UUID: GPU-89d98666-7ceb-ccde-136f-28e562834116)
GPU 0: Tesla P100-PCIE-16GB (UUID: GPU-4b3bcbe7-8762-7baf-cd29-c1c51268360d)
GPU 1: Tesla P100-PCIE-16GB (UUID: GPU-f9acf3b8-b5fa-31c5-ecce-81add0ee6a3e)
";

    #[test]
    fn resolves_each_uuid_to_its_own_line_index() {
        let tool = ListingTool::new(THREE_GPUS);
        let registry = GpuRegistry::new(tool.clone());

        assert_eq!(registry.resolve("GPU-4b3bcbe7-8762-7baf-cd29-c1c51268360d"), Some(0));
        assert_eq!(registry.resolve("GPU-f9acf3b8-b5fa-31c5-ecce-81add0ee6a3e"), Some(1));
        assert_eq!(registry.resolve("GPU-89d98666-7ceb-ccde-136f-28e562834116"), Some(2));
        assert_eq!(registry.known_indices(), vec![0, 1, 2]);
    }

    #[test]
    fn caches_after_first_listing() {
        let tool = ListingTool::new(THREE_GPUS);
        let registry = GpuRegistry::new(tool.clone());

        let first = registry.resolve("GPU-f9acf3b8-b5fa-31c5-ecce-81add0ee6a3e");
        let second = registry.resolve("GPU-f9acf3b8-b5fa-31c5-ecce-81add0ee6a3e");
        assert_eq!(first, second);
        assert_eq!(tool.listings(), 1);
    }

    #[test]
    fn unknown_uuid_is_none_and_does_not_relist() {
        let tool = ListingTool::new(THREE_GPUS);
        let registry = GpuRegistry::new(tool.clone());

        assert_eq!(registry.resolve("GPU-00000000-0000-0000-0000-000000000000"), None);
        assert_eq!(registry.resolve("GPU-ffffffff-0000-0000-0000-000000000000"), None);
        assert_eq!(tool.listings(), 1);
        assert!(registry.is_loaded());
    }

    #[test]
    fn failed_listing_is_retried() {
        let tool = ListingTool::failing();
        let registry = GpuRegistry::new(tool.clone());

        assert_eq!(registry.resolve("GPU-x"), None);
        assert_eq!(registry.resolve("GPU-x"), None);
        assert_eq!(tool.listings(), 2);
        assert!(!registry.is_loaded());
        assert!(registry.known_indices().is_empty());
    }

    #[test]
    fn reset_forces_a_new_listing() {
        let tool = ListingTool::new(THREE_GPUS);
        let registry = GpuRegistry::new(tool.clone());

        registry.resolve("GPU-4b3bcbe7-8762-7baf-cd29-c1c51268360d");
        registry.reset();
        assert!(!registry.is_loaded());
        registry.resolve("GPU-4b3bcbe7-8762-7baf-cd29-c1c51268360d");
        assert_eq!(tool.listings(), 2);
    }

    #[test]
    fn concurrent_first_access_lists_once() {
        let tool = ListingTool::new(THREE_GPUS);
        let registry = Arc::new(GpuRegistry::new(tool.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.resolve("GPU-89d98666-7ceb-ccde-136f-28e562834116")
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(2));
        }
        assert_eq!(tool.listings(), 1);
        assert_eq!(registry.devices().len(), 3);
    }
}
