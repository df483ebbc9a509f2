use types::{DeviceConfiguration, DeviceIdentity, DeviceState, Reading};

fn reading(solar_voltage: f32, solar_current: f32, output_voltage: f32, output_current: f32) -> Reading {
    Reading {
        device_id: "inverter-10-0-0-1".to_string(),
        timestamp_ms: 1,
        solar_voltage,
        solar_current,
        output_voltage,
        output_current,
        internal_temp_c: 30.0,
        panel_temp_c: 45.0,
        aux_rail_voltage: 3.3,
    }
}

#[test]
fn derived_power_and_efficiency() {
    let sample = reading(24.0, 10.0, 12.0, 18.0);
    assert_eq!(sample.solar_power(), 240.0);
    assert_eq!(sample.output_power(), 216.0);
    assert!((sample.efficiency_pct() - 90.0).abs() < 1e-4);
}

#[test]
fn efficiency_is_zero_without_solar_input() {
    let dark = reading(0.0, 0.0, 12.0, 1.0);
    assert_eq!(dark.efficiency_pct(), 0.0);
}

#[test]
fn device_id_follows_ip() {
    let identity = DeviceIdentity::new("Roof", "192.168.1.42", 502, 1);
    assert_eq!(identity.id, "inverter-192-168-1-42");
    assert_eq!(DeviceIdentity::id_for("10.0.0.7"), "inverter-10-0-0-7");
}

#[test]
fn device_state_online_transitions() {
    let mut state = DeviceState::manual("Roof", "192.168.1.42", 502, 1);
    assert!(!state.is_online);
    assert_eq!(state.last_seen_ms, 0);

    state.mark_online(1_700_000_000_000);
    assert!(state.is_online);
    assert_eq!(state.last_seen_ms, 1_700_000_000_000);

    state.mark_offline();
    assert!(!state.is_online);
    assert_eq!(state.last_seen_ms, 1_700_000_000_000);
}

#[test]
fn configuration_register_order() {
    let registers = [0x0003, 1000, 1001, 1002, 1003, 1004, 1005, 1006, 1007];
    let config = DeviceConfiguration::from_registers(&registers).expect("nine registers");
    assert_eq!(config.switch_setup, 3);
    assert_eq!(config.solar_voltage_cal, 1000);
    assert_eq!(config.efficiency_cal, 1007);
    assert_eq!(config.to_registers(), registers);

    assert!(DeviceConfiguration::from_registers(&registers[..8]).is_none());
}

#[test]
fn calibration_accessors_use_fine_scale() {
    let mut config = DeviceConfiguration::default();
    assert!(config.set_calibration(1, 1.5));
    assert_eq!(config.solar_current_cal, 1500);
    assert_eq!(config.calibration(1), Some(1.5));

    assert!(!config.set_calibration(8, 1.0));
    assert_eq!(config.calibration(8), None);
    assert_eq!(config.switch_setup, 0);
}
