use modbus_client::{ClientConfig, DeviceClient, ModbusClient};

/// Runs against a real device or an RTU-over-TCP simulator such as
/// `diagslave -m enc`; skipped unless `MODBUS_TEST_HOST` is set.
#[tokio::test]
async fn diagslave_integration_read() {
    let host = match std::env::var("MODBUS_TEST_HOST") {
        Ok(value) => value,
        Err(_) => return,
    };

    let config = ClientConfig {
        host,
        port: env_u16("MODBUS_TEST_PORT").unwrap_or(1502),
        slave_address: env_u16("MODBUS_TEST_UNIT_ID").unwrap_or(1) as u8,
        timeout_ms: env_u64("MODBUS_TEST_TIMEOUT_MS").unwrap_or(1_000),
        ..ClientConfig::default()
    };

    let client = ModbusClient::new("diagslave", config);
    client.connect().await.expect("connect");
    let reading = client.read_telemetry().await.expect("telemetry");
    assert_eq!(reading.device_id, "diagslave");

    let configuration = client.read_configuration().await.expect("configuration");
    if std::env::var("MODBUS_TEST_WRITE").is_ok() {
        client
            .write_configuration(&configuration)
            .await
            .expect("write back");
    }
    client.disconnect().await;
}

fn env_u16(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
