use modbus_client::frame::{
    append_checksum, build_read_request, build_write_single_request, checksum16,
    encode_read_response, from_float, parse_registers, read_response_len, to_float,
    verify_checksum, FrameError, ReadFunction, READ_INPUT_REGISTERS,
};
use modbus_client::{decode_telemetry, TELEMETRY_REGISTERS};

fn bitwise_crc(bytes: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for byte in bytes {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[test]
fn checksum_matches_bitwise_definition() {
    assert_eq!(checksum16(b"123456789"), 0x4B37);
    let samples: [&[u8]; 4] = [
        &[],
        &[0x01],
        &[0x04, 0x04, 0x00, 0x00, 0x00, 0x07],
        &[0xFF, 0x00, 0x55, 0xAA, 0x12, 0x34, 0x56, 0x78, 0x9A],
    ];
    for sample in samples {
        assert_eq!(checksum16(sample), bitwise_crc(sample), "sample {sample:02x?}");
    }
}

#[test]
fn read_input_request_bytes() {
    let frame = build_read_request(ReadFunction::Input, 4, 0, 7);
    assert_eq!(frame, vec![0x04, 0x04, 0x00, 0x00, 0x00, 0x07, 0xB1, 0x9D]);
    assert!(verify_checksum(&frame));
}

#[test]
fn read_holding_request_bytes() {
    let frame = build_read_request(ReadFunction::Holding, 1, 0, 9);
    assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x09, 0x85, 0xCC]);
}

#[test]
fn write_single_request_bytes() {
    let frame = build_write_single_request(1, 2, 1000);
    assert_eq!(frame, vec![0x01, 0x06, 0x00, 0x02, 0x03, 0xE8, 0x28, 0xB4]);
    assert!(verify_checksum(&frame));

    // the device echoes the request as its response
    let mut echo = frame[..6].to_vec();
    append_checksum(&mut echo);
    assert_eq!(echo, frame);
}

#[test]
fn verify_rejects_short_and_tampered_frames() {
    assert!(!verify_checksum(&[]));
    assert!(!verify_checksum(&[0x01, 0x02, 0x03]));

    let mut frame = build_read_request(ReadFunction::Input, 1, 0, 7);
    frame[3] ^= 0x01;
    assert!(!verify_checksum(&frame));
}

#[test]
fn parse_telemetry_response() {
    let registers = [1000, 2450, 1210, 3500, 4100, 3300, 820];
    let response = encode_read_response(0x04, READ_INPUT_REGISTERS, &registers).expect("encode");
    assert_eq!(response.len(), 19);
    assert_eq!(response.len(), read_response_len(TELEMETRY_REGISTERS));
    assert_eq!(&response[..5], &[0x04, 0x04, 0x0E, 0x03, 0xE8]);
    assert_eq!(&response[17..], &[0x20, 0xCB]);

    let parsed = parse_registers(&response).expect("parse");
    assert_eq!(parsed, registers);

    let reading = decode_telemetry("inverter-10-0-0-4", 42, &parsed).expect("decode");
    assert_eq!(reading.solar_current, 10.0);
    assert_eq!(reading.solar_voltage, 24.5);
    assert_eq!(reading.output_voltage, 12.1);
    assert_eq!(reading.internal_temp_c, 35.0);
    assert_eq!(reading.panel_temp_c, 41.0);
    assert_eq!(reading.aux_rail_voltage, 3.3);
    assert_eq!(reading.output_current, 8.2);
    assert_eq!(reading.timestamp_ms, 42);
}

#[test]
fn parse_rejects_malformed_responses() {
    for len in 0..5 {
        let short = vec![0x01; len];
        assert!(matches!(
            parse_registers(&short),
            Err(FrameError::TooShort { .. })
        ));
    }

    let mut tampered = encode_read_response(1, READ_INPUT_REGISTERS, &[1, 2, 3]).expect("encode");
    tampered[4] ^= 0xFF;
    assert!(matches!(
        parse_registers(&tampered),
        Err(FrameError::ChecksumMismatch { .. })
    ));

    // byte count claims more data than the frame holds
    let mut lying = vec![0x01, READ_INPUT_REGISTERS, 0x20, 0x00, 0x01];
    append_checksum(&mut lying);
    assert_eq!(
        parse_registers(&lying),
        Err(FrameError::Truncated {
            byte_count: 0x20,
            available: 2
        })
    );
}

#[test]
fn encode_rejects_register_counts_beyond_byte_count() {
    let largest = vec![0xABCDu16; 127];
    let response = encode_read_response(1, READ_INPUT_REGISTERS, &largest).expect("127 registers fit");
    assert_eq!(response[2], 254);
    assert_eq!(parse_registers(&response).expect("parse"), largest);

    let too_many = vec![0u16; 128];
    assert_eq!(
        encode_read_response(1, READ_INPUT_REGISTERS, &too_many),
        Err(FrameError::TooManyRegisters { count: 128 })
    );
}

#[test]
fn decode_requires_seven_registers() {
    assert!(decode_telemetry("d", 0, &[1, 2, 3, 4, 5, 6]).is_err());
    assert!(decode_telemetry("d", 0, &[1, 2, 3, 4, 5, 6, 7, 8]).is_err());
}

#[test]
fn scaling_round_trips_within_one_unit() {
    for scale in [100.0f32, 1000.0] {
        let max = f32::from(u16::MAX) / scale;
        let mut value = 0.0f32;
        while value < max - 1.0 {
            let restored = to_float(from_float(value, scale), scale);
            assert!(
                (restored - value).abs() <= 1.0 / scale + 1e-4,
                "scale {scale} value {value} restored {restored}"
            );
            value += 0.37;
        }
    }
    assert_eq!(to_float(1000, 100.0), 10.0);
    assert_eq!(from_float(3.3, 1000.0), 3300);
    assert_eq!(from_float(-1.0, 100.0), 0);
}
