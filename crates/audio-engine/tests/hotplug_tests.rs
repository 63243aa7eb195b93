//! Device hot-plug integration tests
//!
//! Devices appear and disappear on the simulated server while the engine is
//! running; streams must follow the device snapshots.

use rvoip_audio_engine::backend::simulated::SimulatedServer;
use rvoip_audio_engine::{
    AudioFormat, DeviceDescriptor, DevicePreferences, Direction, EngineConfig, EngineContext,
    EngineError, MemoryRing, ServerEvent, StreamRole,
};
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rvoip_audio_engine=debug")
        .with_test_writer()
        .try_init();
}

fn speaker(index: u32, name: &str, display: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(index, name, display, AudioFormat::studio_stereo())
}

fn microphone(index: u32, name: &str, display: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(index, name, display, AudioFormat::wideband_mono())
}

fn new_engine(server: &SimulatedServer) -> EngineContext {
    EngineContext::new(
        EngineConfig::new().with_start_timeout_ms(2_000),
        Arc::new(server.clone()),
        Arc::new(MemoryRing::with_rate(16000)),
        Arc::new(MemoryRing::with_rate(16000)),
    )
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn device_of(engine: &EngineContext, role: StreamRole) -> Option<String> {
    engine.stream_device(role).map(|d| d.system_name)
}

fn on_device(engine: &EngineContext, role: StreamRole, name: &str) -> bool {
    device_of(engine, role).as_deref() == Some(name) && engine.is_stream_ready(role)
}

#[cfg(test)]
mod hotplug_tests {
    use super::*;

    #[test]
    #[serial]
    fn test_unplugged_preferred_device_falls_back_and_returns() {
        init_logging();
        let server = SimulatedServer::new()
            .with_device(Direction::Playback, speaker(0, "sink0", "Speakers"))
            .with_device(Direction::Capture, microphone(0, "hw:0", "Default Mic"))
            .with_device(Direction::Capture, microphone(1, "hw:1", "Headset"));
        let engine = new_engine(&server);
        let preferences = DevicePreferences::default().with_device(StreamRole::Capture, "hw:1");

        engine.start(&preferences, None).unwrap();
        assert!(wait_until(|| on_device(&engine, StreamRole::Capture, "hw:1")));
        let headset_stream = server.stream(StreamRole::Capture).unwrap();

        server.unplug(Direction::Capture, "hw:1");
        assert!(wait_until(|| on_device(&engine, StreamRole::Capture, "hw:0")));
        assert_eq!(headset_stream.lifecycle(), vec!["connect", "disconnect", "release"]);
        assert_eq!(engine.get_device_list(Direction::Capture), vec!["Default Mic".to_string()]);

        server.plug(Direction::Capture, microphone(1, "hw:1", "Headset"));
        assert!(wait_until(|| on_device(&engine, StreamRole::Capture, "hw:1")));
        assert_eq!(
            engine.get_device_list(Direction::Capture),
            vec!["Default Mic".to_string(), "Headset".to_string()]
        );
    }

    #[test]
    #[serial]
    fn test_direction_without_devices_recovers_on_plug() {
        init_logging();
        let server = SimulatedServer::new()
            .with_device(Direction::Playback, speaker(0, "sink0", "Speakers"))
            .with_device(Direction::Capture, microphone(0, "source0", "Microphone"));
        let engine = new_engine(&server);
        engine.start(&DevicePreferences::default(), None).unwrap();
        assert!(wait_until(|| on_device(&engine, StreamRole::Capture, "source0")));
        let capture = server.stream(StreamRole::Capture).unwrap();

        server.unplug(Direction::Playback, "sink0");
        assert!(wait_until(|| device_of(&engine, StreamRole::Playback).is_none()
            && device_of(&engine, StreamRole::Ringtone).is_none()));
        assert!(engine.is_running());

        // The capture direction is untouched.
        assert_eq!(server.stream(StreamRole::Capture).unwrap().id(), capture.id());
        assert!(capture.is_connected());

        server.plug(Direction::Playback, speaker(0, "sink1", "USB Speakers"));
        assert!(wait_until(|| on_device(&engine, StreamRole::Playback, "sink1")
            && on_device(&engine, StreamRole::Ringtone, "sink1")));
        assert_eq!(
            engine.stream_format(StreamRole::Playback),
            Some(AudioFormat::studio_stereo())
        );
    }

    #[test]
    #[serial]
    fn test_unrelated_hotplug_keeps_streams() {
        init_logging();
        let server = SimulatedServer::new()
            .with_device(Direction::Playback, speaker(0, "sink0", "Speakers"))
            .with_device(Direction::Capture, microphone(0, "source0", "Microphone"));
        let engine = new_engine(&server);
        engine.start(&DevicePreferences::default(), None).unwrap();
        assert!(wait_until(|| on_device(&engine, StreamRole::Playback, "sink0")));
        let playback = server.stream(StreamRole::Playback).unwrap();

        server.plug(Direction::Playback, speaker(1, "sink1", "HDMI"));
        assert!(wait_until(|| engine.get_device_list(Direction::Playback).len() == 2));

        assert_eq!(server.streams(StreamRole::Playback).len(), 1);
        assert!(playback.is_connected());
        assert!(on_device(&engine, StreamRole::Playback, "sink0"));
    }

    #[test]
    #[serial]
    fn test_removal_during_enumeration_ignores_stale_results() {
        init_logging();
        let headset = speaker(1, "sink1", "USB Headset");
        let server = SimulatedServer::new()
            .with_device(Direction::Playback, speaker(0, "sink0", "Speakers"))
            .with_device(Direction::Playback, headset.clone())
            .with_device(Direction::Capture, microphone(0, "source0", "Microphone"))
            .with_deferred_enumeration();
        let engine = new_engine(&server);
        let preferences = DevicePreferences::default().with_device(StreamRole::Playback, "sink1");

        let result = engine.start(&preferences, Some(Duration::from_millis(100)));
        assert!(matches!(result, Err(EngineError::NoDeviceAvailable { .. })));
        let first = server.pending_enumerations(Direction::Playback);
        assert_eq!(first.len(), 1);

        server.unplug(Direction::Playback, "sink1");
        assert!(wait_until(|| server.pending_enumerations(Direction::Playback).len() == 2));

        // Results of the interrupted enumeration still list the headset.
        assert!(server.dispatch(ServerEvent::Device {
            direction: Direction::Playback,
            epoch: first[0],
            device: headset,
        }));
        assert!(server.dispatch(ServerEvent::DeviceListEnd {
            direction: Direction::Playback,
            epoch: first[0],
        }));
        assert!(engine.get_device_list(Direction::Playback).is_empty());
        assert!(device_of(&engine, StreamRole::Playback).is_none());

        server.complete_enumerations();
        let mut saw_headset = false;
        assert!(wait_until(|| {
            saw_headset |= device_of(&engine, StreamRole::Playback).as_deref() == Some("sink1")
                || engine.get_device_list(Direction::Playback).contains(&"USB Headset".to_string());
            on_device(&engine, StreamRole::Playback, "sink0")
        }));
        assert!(!saw_headset);
        assert_eq!(engine.get_device_list(Direction::Playback), vec!["Speakers".to_string()]);
        engine.stop().unwrap();
    }

    #[test]
    fn test_select_device_switches_streams() {
        init_logging();
        let server = SimulatedServer::new()
            .with_device(Direction::Playback, speaker(0, "sink0", "Speakers"))
            .with_device(Direction::Playback, speaker(1, "sink1", "Headphones"))
            .with_device(Direction::Capture, microphone(0, "source0", "Microphone"));
        let engine = new_engine(&server);
        engine.start(&DevicePreferences::default(), None).unwrap();
        assert_eq!(device_of(&engine, StreamRole::Playback).as_deref(), Some("sink0"));

        engine.select_device(Direction::Playback, 1).unwrap();
        assert_eq!(device_of(&engine, StreamRole::Playback).as_deref(), Some("sink1"));
        assert_eq!(device_of(&engine, StreamRole::Ringtone).as_deref(), Some("sink0"));

        engine.select_ringtone_device(1).unwrap();
        assert_eq!(device_of(&engine, StreamRole::Ringtone).as_deref(), Some("sink1"));

        assert_eq!(
            engine.select_device(Direction::Capture, 5),
            Err(EngineError::InvalidDeviceIndex {
                direction: Direction::Capture,
                index: 5,
                available: 1
            })
        );
        assert_eq!(device_of(&engine, StreamRole::Capture).as_deref(), Some("source0"));
    }

    #[test]
    #[serial]
    fn test_selected_device_removal_falls_back_to_first() {
        init_logging();
        let server = SimulatedServer::new()
            .with_device(Direction::Playback, speaker(0, "sink0", "Speakers"))
            .with_device(Direction::Playback, speaker(1, "sink1", "Headphones"))
            .with_device(Direction::Capture, microphone(0, "source0", "Microphone"));
        let engine = new_engine(&server);
        engine.start(&DevicePreferences::default(), None).unwrap();
        engine.select_device(Direction::Playback, 1).unwrap();
        assert!(wait_until(|| on_device(&engine, StreamRole::Playback, "sink1")));

        server.unplug(Direction::Playback, "sink1");
        assert!(wait_until(|| on_device(&engine, StreamRole::Playback, "sink0")));
        assert_eq!(engine.get_device_list(Direction::Playback), vec!["Speakers".to_string()]);
    }

    #[test]
    fn test_select_before_start_fails_without_devices() {
        let server = SimulatedServer::new()
            .with_device(Direction::Playback, speaker(0, "sink0", "Speakers"));
        let engine = new_engine(&server);

        assert_eq!(
            engine.select_device(Direction::Playback, 0),
            Err(EngineError::InvalidDeviceIndex {
                direction: Direction::Playback,
                index: 0,
                available: 0
            })
        );
    }
}
