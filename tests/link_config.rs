use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use serial_mjpeg::device::Parity;
use serial_mjpeg::LinkConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SERIAL_MJPEG_CONFIG",
        "SERIAL_MJPEG_DEVICE",
        "SERIAL_MJPEG_BAUD",
        "SERIAL_MJPEG_DIAGNOSTIC_MS",
        "SERIAL_MJPEG_BUFFER_BYTES",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "serial": {
            "device": "/dev/ttyACM3",
            "baud_rate": 921600,
            "parity": "even"
        },
        "buffer": {
            "capacity_bytes": 65536,
            "overflow_threshold_bytes": 40000
        },
        "timing": {
            "read_timeout_ms": 50,
            "join_timeout_ms": 2000
        },
        "devices": {
            "signatures": [{ "vid": 4660, "pid": 22136, "name": "bench cam" }],
            "allow_generic_usb": false
        }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("SERIAL_MJPEG_CONFIG", file.path());
    std::env::set_var("SERIAL_MJPEG_BAUD", "460800");
    std::env::set_var("SERIAL_MJPEG_DIAGNOSTIC_MS", "2500");

    let cfg = LinkConfig::load().expect("load config");

    assert_eq!(cfg.serial.device.as_deref(), Some("/dev/ttyACM3"));
    assert_eq!(cfg.serial.baud_rate, 460800);
    assert_eq!(cfg.serial.parity, Parity::Even);
    assert_eq!(cfg.serial.data_bits, 8);
    assert_eq!(cfg.buffer.capacity_bytes, 65536);
    assert_eq!(cfg.buffer.overflow_threshold(), 40000);
    assert_eq!(cfg.timing.read_timeout, Duration::from_millis(50));
    assert_eq!(cfg.timing.join_timeout, Duration::from_secs(2));
    assert_eq!(cfg.timing.diagnostic_timeout, Duration::from_millis(2500));
    assert_eq!(cfg.timing.idle_sleep, Duration::from_millis(5));
    assert_eq!(cfg.devices.signatures.len(), 1);
    assert_eq!(cfg.devices.signatures[0].vid, 0x1234);
    assert!(!cfg.devices.allow_generic_usb);

    clear_env();
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
[serial]
baud_rate = 230400
stop_bits = 2

[timing]
diagnostic_timeout_ms = 8000
start_delay_ms = 0
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = LinkConfig::load_with(Some(file.path())).expect("load config");
    assert_eq!(cfg.serial.baud_rate, 230400);
    assert_eq!(cfg.serial.stop_bits, 2);
    assert_eq!(cfg.timing.diagnostic_timeout, Duration::from_secs(8));
    assert_eq!(cfg.timing.start_delay, Duration::ZERO);
    assert_eq!(cfg.serial.device, None);

    clear_env();
}

#[test]
fn buffer_override_rederives_threshold() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SERIAL_MJPEG_BUFFER_BYTES", "8192");
    std::env::set_var("SERIAL_MJPEG_DEVICE", "stub://bench");
    let cfg = LinkConfig::load_with(None).expect("load config");
    assert_eq!(cfg.buffer.capacity_bytes, 8192);
    assert_eq!(cfg.assembler_config().overflow_threshold, 4096);
    assert_eq!(cfg.serial.device.as_deref(), Some("stub://bench"));

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SERIAL_MJPEG_BAUD", "fast");
    let err = LinkConfig::load_with(None).expect_err("non-numeric baud");
    assert!(err.to_string().contains("SERIAL_MJPEG_BAUD"));
    clear_env();

    std::env::set_var("SERIAL_MJPEG_BUFFER_BYTES", "3");
    assert!(LinkConfig::load_with(None).is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "buffer": { "capacity_bytes": 1024, "overflow_threshold_bytes": 2048 } }"#)
        .expect("write config");
    let err = LinkConfig::load_with(Some(file.path())).expect_err("threshold above capacity");
    assert!(err.to_string().contains("overflow threshold"));

    let mut bad = NamedTempFile::new().expect("temp config");
    bad.write_all(b"{ not json").expect("write config");
    let err = LinkConfig::load_with(Some(bad.path())).expect_err("malformed file");
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
