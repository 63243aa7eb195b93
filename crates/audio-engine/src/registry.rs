//! Device registry
//!
//! Per direction, the registry publishes an immutable snapshot of the
//! devices the server reported. Snapshots are rebuilt wholesale: an
//! enumeration collects into a pending list tagged with an epoch and
//! replaces the published snapshot only when its end marker arrives. A
//! hot-plug event clears the snapshot and starts a new epoch, so results
//! from an interrupted enumeration are discarded instead of merged.

use crate::backend::AudioServer;
use crate::error::{EngineError, EngineResult};
use crate::types::{DeviceDescriptor, Direction, HotplugKind};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Default)]
struct DirectionDevices {
    published: Arc<Vec<DeviceDescriptor>>,
    pending: Vec<DeviceDescriptor>,
    enumerating: bool,
    epoch: u64,
    generation: u64,
}

/// Device snapshots for both directions
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    playback: DirectionDevices,
    capture: DirectionDevices,
    next_epoch: u64,
}

impl DeviceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn side(&self, direction: Direction) -> &DirectionDevices {
        match direction {
            Direction::Playback => &self.playback,
            Direction::Capture => &self.capture,
        }
    }

    fn side_mut(&mut self, direction: Direction) -> &mut DirectionDevices {
        match direction {
            Direction::Playback => &mut self.playback,
            Direction::Capture => &mut self.capture,
        }
    }

    /// Open a new enumeration epoch for `direction`; earlier epochs become stale
    pub fn begin_enumeration(&mut self, direction: Direction) -> u64 {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let side = self.side_mut(direction);
        side.pending.clear();
        side.enumerating = true;
        side.epoch = epoch;
        trace!("Enumerating {} devices (epoch {})", direction, epoch);
        epoch
    }

    /// Begin an epoch and ask the server for its devices
    pub fn enumerate(&mut self, direction: Direction, server: &dyn AudioServer) -> EngineResult<u64> {
        let epoch = self.begin_enumeration(direction);
        if let Err(e) = server.enumerate(direction, epoch) {
            let side = self.side_mut(direction);
            side.enumerating = false;
            side.pending.clear();
            return Err(e);
        }
        Ok(epoch)
    }

    /// Record one enumerated device. Returns `false` if the result was
    /// discarded as stale or duplicate.
    pub fn add_device(&mut self, direction: Direction, epoch: u64, device: DeviceDescriptor) -> bool {
        let side = self.side_mut(direction);
        if !side.enumerating || side.epoch != epoch {
            debug!(
                "Discarding stale {} device '{}' from epoch {}",
                direction, device.system_name, epoch
            );
            return false;
        }
        if side.pending.iter().any(|d| d.system_name == device.system_name) {
            warn!(
                "Duplicate {} device '{}' in enumeration, keeping the first",
                direction, device.system_name
            );
            return false;
        }
        side.pending.push(device);
        true
    }

    /// Publish the pending list of `epoch`. Returns `false` for a stale marker.
    pub fn finish_enumeration(&mut self, direction: Direction, epoch: u64) -> bool {
        let side = self.side_mut(direction);
        if !side.enumerating || side.epoch != epoch {
            debug!("Ignoring stale {} end-of-list for epoch {}", direction, epoch);
            return false;
        }
        side.published = Arc::new(std::mem::take(&mut side.pending));
        side.enumerating = false;
        side.generation += 1;
        info!(
            "{} devices: {}",
            direction,
            side.published
                .iter()
                .map(|d| d.system_name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        true
    }

    /// Drop the snapshot for `direction` and re-enumerate it
    pub fn on_hotplug(
        &mut self,
        direction: Direction,
        kind: HotplugKind,
        server: &dyn AudioServer,
    ) -> EngineResult<u64> {
        debug!("{} device {:?}; rebuilding device list", direction, kind);
        let side = self.side_mut(direction);
        side.published = Arc::new(Vec::new());
        side.pending.clear();
        self.enumerate(direction, server)
    }

    /// Whether an enumeration for `direction` is in flight
    pub fn is_enumerating(&self, direction: Direction) -> bool {
        self.side(direction).enumerating
    }

    /// Whether any enumeration is in flight
    pub fn any_enumerating(&self) -> bool {
        self.playback.enumerating || self.capture.enumerating
    }

    /// Number of snapshots published for `direction`
    pub fn generation(&self, direction: Direction) -> u64 {
        self.side(direction).generation
    }

    /// Current published snapshot
    pub fn snapshot(&self, direction: Direction) -> Arc<Vec<DeviceDescriptor>> {
        self.side(direction).published.clone()
    }

    /// Display names in snapshot order
    pub fn names(&self, direction: Direction) -> Vec<String> {
        self.side(direction)
            .published
            .iter()
            .map(|d| d.display_name.clone())
            .collect()
    }

    /// Device at `index` in the snapshot
    pub fn device_at(&self, direction: Direction, index: usize) -> EngineResult<DeviceDescriptor> {
        let devices = &self.side(direction).published;
        devices
            .get(index)
            .cloned()
            .ok_or(EngineError::InvalidDeviceIndex {
                direction,
                index,
                available: devices.len(),
            })
    }

    /// Whether the snapshot has a device named `system_name`
    pub fn contains(&self, direction: Direction, system_name: &str) -> bool {
        self.side(direction)
            .published
            .iter()
            .any(|d| d.system_name == system_name)
    }

    /// Pick the device for a stream: the exact system-name match, otherwise
    /// the first device of the snapshot.
    pub fn resolve(&self, direction: Direction, preferred: Option<&str>) -> EngineResult<DeviceDescriptor> {
        let devices = &self.side(direction).published;
        let Some(first) = devices.first() else {
            return Err(EngineError::NoDeviceAvailable { direction });
        };
        let Some(preferred) = preferred else {
            return Ok(first.clone());
        };
        match devices.iter().find(|d| d.system_name == preferred) {
            Some(device) => Ok(device.clone()),
            None => {
                warn!(
                    "Preferred {} device '{}' not found, falling back to '{}'",
                    direction, preferred, first.system_name
                );
                Ok(first.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RawStream, StreamParams};
    use crate::error::StreamError;
    use crate::event_loop::LoopHandle;
    use crate::types::AudioFormat;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingServer {
        requests: Mutex<Vec<(Direction, u64)>>,
        refuse: bool,
    }

    impl AudioServer for RecordingServer {
        fn name(&self) -> &str {
            "recording"
        }

        fn connect(&self, _: &str, _: LoopHandle) -> Result<(), EngineError> {
            Ok(())
        }

        fn subscribe_hotplug(&self) -> Result<(), EngineError> {
            Ok(())
        }

        fn enumerate(&self, direction: Direction, epoch: u64) -> Result<(), EngineError> {
            if self.refuse {
                return Err(EngineError::transient("refused"));
            }
            self.requests.lock().push((direction, epoch));
            Ok(())
        }

        fn supports_format(&self, _: Direction, _: &AudioFormat) -> bool {
            true
        }

        fn create_stream(&self, _: &StreamParams) -> Result<Box<dyn RawStream>, StreamError> {
            Err(StreamError::rejected("not supported"))
        }

        fn disconnect(&self) {}
    }

    fn mic(index: u32, name: &str, display: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(index, name, display, AudioFormat::wideband_mono())
    }

    fn published(registry: &mut DeviceRegistry, direction: Direction, devices: &[DeviceDescriptor]) {
        let epoch = registry.begin_enumeration(direction);
        for device in devices {
            registry.add_device(direction, epoch, device.clone());
        }
        assert!(registry.finish_enumeration(direction, epoch));
    }

    #[test]
    #[traced_test]
    fn test_resolve_falls_back_to_first_device() {
        let mut registry = DeviceRegistry::new();
        published(
            &mut registry,
            Direction::Capture,
            &[mic(0, "hw:0", "Default Mic"), mic(1, "hw:1", "Headset")],
        );

        let device = registry.resolve(Direction::Capture, Some("hw:2")).unwrap();
        assert_eq!(device.system_name, "hw:0");
        assert!(logs_contain("Preferred capture device 'hw:2' not found"));

        let device = registry.resolve(Direction::Capture, Some("hw:1")).unwrap();
        assert_eq!(device.display_name, "Headset");
    }

    #[test]
    fn test_empty_snapshot_has_no_device() {
        let registry = DeviceRegistry::new();
        assert_eq!(
            registry.resolve(Direction::Playback, None),
            Err(EngineError::NoDeviceAvailable {
                direction: Direction::Playback
            })
        );
    }

    #[test]
    fn test_snapshot_published_only_at_end_marker() {
        let mut registry = DeviceRegistry::new();
        let epoch = registry.begin_enumeration(Direction::Playback);
        registry.add_device(Direction::Playback, epoch, mic(0, "sink0", "Speakers"));
        assert!(registry.is_enumerating(Direction::Playback));
        assert!(registry.snapshot(Direction::Playback).is_empty());

        registry.finish_enumeration(Direction::Playback, epoch);
        assert!(!registry.any_enumerating());
        assert_eq!(registry.names(Direction::Playback), vec!["Speakers".to_string()]);
        assert_eq!(registry.generation(Direction::Playback), 1);
    }

    #[test]
    fn test_removal_mid_enumeration_discards_partial_results() {
        let server = RecordingServer::default();
        let mut registry = DeviceRegistry::new();
        let first = registry.enumerate(Direction::Capture, &server).unwrap();
        registry.add_device(Direction::Capture, first, mic(0, "hw:0", "Default Mic"));

        let second = registry
            .on_hotplug(Direction::Capture, HotplugKind::Removed, &server)
            .unwrap();
        assert!(second > first);

        // Late results of the interrupted enumeration.
        assert!(!registry.add_device(Direction::Capture, first, mic(1, "hw:1", "Headset")));
        assert!(!registry.finish_enumeration(Direction::Capture, first));
        assert!(registry.is_enumerating(Direction::Capture));

        registry.add_device(Direction::Capture, second, mic(0, "hw:0", "Default Mic"));
        registry.finish_enumeration(Direction::Capture, second);

        assert!(!registry.contains(Direction::Capture, "hw:1"));
        let device = registry.resolve(Direction::Capture, Some("hw:1")).unwrap();
        assert_eq!(device.system_name, "hw:0");
        assert_eq!(*server.requests.lock(), vec![(Direction::Capture, first), (Direction::Capture, second)]);
    }

    #[test]
    fn test_hotplug_clears_snapshot_immediately() {
        let server = RecordingServer::default();
        let mut registry = DeviceRegistry::new();
        published(&mut registry, Direction::Playback, &[mic(0, "sink0", "Speakers")]);

        registry
            .on_hotplug(Direction::Playback, HotplugKind::Added, &server)
            .unwrap();
        assert!(registry.snapshot(Direction::Playback).is_empty());
        assert!(registry.is_enumerating(Direction::Playback));
    }

    #[test]
    fn test_failed_enumeration_clears_flag() {
        let server = RecordingServer {
            refuse: true,
            ..Default::default()
        };
        let mut registry = DeviceRegistry::new();
        assert!(registry.enumerate(Direction::Playback, &server).is_err());
        assert!(!registry.is_enumerating(Direction::Playback));
    }

    #[test]
    fn test_duplicate_system_names_are_skipped() {
        let mut registry = DeviceRegistry::new();
        published(
            &mut registry,
            Direction::Capture,
            &[mic(0, "hw:0", "Mic"), mic(3, "hw:0", "Mic again")],
        );
        assert_eq!(registry.snapshot(Direction::Capture).len(), 1);
    }

    #[test]
    fn test_device_at_bounds() {
        let mut registry = DeviceRegistry::new();
        published(&mut registry, Direction::Capture, &[mic(0, "hw:0", "Mic")]);
        assert!(registry.device_at(Direction::Capture, 0).is_ok());
        assert_eq!(
            registry.device_at(Direction::Capture, 4),
            Err(EngineError::InvalidDeviceIndex {
                direction: Direction::Capture,
                index: 4,
                available: 1
            })
        );
    }
}
