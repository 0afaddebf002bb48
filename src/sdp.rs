//! Service Discovery Protocol helper (C1).
//!
//! `bluer`/`blez` expose no SDP *record* API of their own — their
//! `BT_SECURITY_SDP` constant (see `l2cap.rs`) is an unrelated L2CAP socket
//! security level. This module talks to the local SDP daemon directly
//! through the same `libbluetooth` bindgen crate `blez`'s `l2cap` feature
//! already depends on, porting the three operations of the original
//! `sdp.cpp` one at a time.

use crate::error::{Error, ErrorKind, Result};
use bluer::Address;
use libbluetooth::bluetooth::bdaddr_t;
use libbluetooth::sdp::{
    sdp_list_t, sdp_profile_desc_t, sdp_record_t, sdp_session_t, uuid_t, SDP_UUID128,
};
use libbluetooth::sdp_lib::{
    sdp_close, sdp_connect, sdp_data_alloc, sdp_device_record_unregister, sdp_get_access_protos,
    sdp_get_proto_port, sdp_list_append, sdp_list_free, sdp_record_alloc, sdp_record_free,
    sdp_record_register, sdp_service_search_attr_req, sdp_set_access_protos, sdp_set_browse_groups,
    sdp_set_info_attr, sdp_set_profile_descs, sdp_set_service_classes, sdp_set_service_id,
    sdp_uuid128_create, sdp_uuid16_create,
};
use std::ffi::CString;
use std::os::raw::c_int;
use std::ptr;
use uuid::Uuid;

/// Serial Port Profile UUID (`00001101-0000-1000-8000-00805F9B34FB`).
pub const SPP_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5f9b_34fb);

const SERIAL_PORT_CLASS: u16 = 0x1101;
const PUBLIC_BROWSE_GROUP: u16 = 0x1002;
const L2CAP_UUID: u16 = 0x0100;
const RFCOMM_UUID: u16 = 0x0003;
const SDP_RETRY_IF_BUSY: u32 = 0x01;
const SDP_RECORD_PERSIST: u8 = 0x02;
/// SerialPort profile version 1.0, per spec's profile descriptor requirement.
const SPP_PROFILE_VERSION: u16 = 0x0100;

/// An opaque handle to a registered SPP record. Must be unregistered via
/// [`unregister_spp`] before the owning transport shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdpHandle(pub u32);

fn any_addr() -> bdaddr_t {
    // BDADDR_ANY: all-zero address.
    bdaddr_t { b: [0; 6] }
}

fn local_addr() -> bdaddr_t {
    // BDADDR_LOCAL: all-zero except the final byte, per the BlueZ headers.
    bdaddr_t { b: [0, 0, 0, 0xff, 0xff, 0xff] }
}

fn address_to_bdaddr(addr: Address) -> bdaddr_t {
    let mut b = addr.0;
    b.reverse();
    bdaddr_t { b }
}

fn uuid_to_uuid128(uuid: Uuid) -> uuid_t {
    let mut out = uuid_t::default();
    let bytes = uuid.as_bytes();
    unsafe { sdp_uuid128_create(&mut out, bytes.as_ptr() as *const _) };
    out
}

struct SdpList(*mut sdp_list_t);

impl SdpList {
    fn new() -> Self {
        Self(ptr::null_mut())
    }

    fn append(&mut self, data: *mut std::ffi::c_void) {
        self.0 = unsafe { sdp_list_append(self.0, data) };
    }

    fn as_ptr(&self) -> *mut sdp_list_t {
        self.0
    }
}

impl Drop for SdpList {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { sdp_list_free(self.0, None) };
        }
    }
}

struct SdpRecord(*mut sdp_record_t);

impl SdpRecord {
    fn alloc() -> Result<Self> {
        let rec = unsafe { sdp_record_alloc() };
        if rec.is_null() {
            return Err(Error::new(ErrorKind::SdpRegisterFailed));
        }
        Ok(Self(rec))
    }
}

impl Drop for SdpRecord {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { sdp_record_free(self.0) };
        }
    }
}

struct SdpSession(*mut sdp_session_t);

impl SdpSession {
    fn connect(dst: bdaddr_t) -> Result<Self> {
        let sess = unsafe { sdp_connect(&any_addr(), &dst, SDP_RETRY_IF_BUSY) };
        if sess.is_null() {
            return Err(Error::new(ErrorKind::SdpUnavailable));
        }
        Ok(Self(sess))
    }
}

impl Drop for SdpSession {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { sdp_close(self.0) };
        }
    }
}

/// Registers an SPP record advertising `channel`, returning the handle to
/// pass to [`unregister_spp`] on shutdown.
pub fn register_spp(service_name: &str, service_uuid: Uuid, channel: u8) -> Result<SdpHandle> {
    let session = SdpSession::connect(local_addr())?;
    let record = SdpRecord::alloc()?;

    let mut svc_uuid = uuid_to_uuid128(service_uuid);
    unsafe { sdp_set_service_id(record.0, svc_uuid) };

    let mut serial_class = uuid_t::default();
    unsafe { sdp_uuid16_create(&mut serial_class, SERIAL_PORT_CLASS) };
    let mut classes = SdpList::new();
    classes.append(&mut serial_class as *mut _ as *mut _);
    classes.append(&mut svc_uuid as *mut _ as *mut _);
    unsafe { sdp_set_service_classes(record.0, classes.as_ptr()) };

    let mut profile_uuid = uuid_t::default();
    unsafe { sdp_uuid16_create(&mut profile_uuid, SERIAL_PORT_CLASS) };
    let mut profile_desc = sdp_profile_desc_t { uuid: profile_uuid, version: SPP_PROFILE_VERSION };
    let mut profiles = SdpList::new();
    profiles.append(&mut profile_desc as *mut _ as *mut _);
    unsafe { sdp_set_profile_descs(record.0, profiles.as_ptr()) };

    let mut browse_uuid = uuid_t::default();
    unsafe { sdp_uuid16_create(&mut browse_uuid, PUBLIC_BROWSE_GROUP) };
    let mut browse_groups = SdpList::new();
    browse_groups.append(&mut browse_uuid as *mut _ as *mut _);
    unsafe { sdp_set_browse_groups(record.0, browse_groups.as_ptr()) };

    let mut l2cap_uuid = uuid_t::default();
    unsafe { sdp_uuid16_create(&mut l2cap_uuid, L2CAP_UUID) };
    let mut l2cap_list = SdpList::new();
    l2cap_list.append(&mut l2cap_uuid as *mut _ as *mut _);

    let mut rfcomm_uuid = uuid_t::default();
    unsafe { sdp_uuid16_create(&mut rfcomm_uuid, RFCOMM_UUID) };
    let mut channel_data = unsafe { sdp_data_alloc(SDP_UUID128 as _, &channel as *const _ as *const _) };
    let mut rfcomm_list = SdpList::new();
    rfcomm_list.append(&mut rfcomm_uuid as *mut _ as *mut _);
    rfcomm_list.append(&mut channel_data as *mut _ as *mut _);

    let mut access_proto = SdpList::new();
    access_proto.append(l2cap_list.as_ptr() as *mut _);
    access_proto.append(rfcomm_list.as_ptr() as *mut _);

    let mut access_protos = SdpList::new();
    access_protos.append(access_proto.as_ptr() as *mut _);
    unsafe { sdp_set_access_protos(record.0, access_protos.as_ptr()) };

    let name = CString::new(service_name).unwrap_or_default();
    let provider = CString::new("bluetooth-mqtt-bridge").unwrap_or_default();
    let description = CString::new("RFCOMM serial bridge").unwrap_or_default();
    unsafe { sdp_set_info_attr(record.0, name.as_ptr(), provider.as_ptr(), description.as_ptr()) };

    let rc = unsafe { sdp_record_register(session.0, record.0, SDP_RECORD_PERSIST) };
    if rc != 0 {
        return Err(Error::new(ErrorKind::SdpRegisterFailed));
    }

    let handle = unsafe { (*record.0).handle };
    Ok(SdpHandle(handle))
}

/// Unregisters a previously registered SPP record.
pub fn unregister_spp(handle: SdpHandle) -> Result<()> {
    let session = SdpSession::connect(local_addr())?;
    let mut record = SdpRecord::alloc()?;
    unsafe { (*record.0).handle = handle.0 };

    let rc = unsafe { sdp_device_record_unregister(session.0, &mut any_addr(), record.0) };
    if rc != 0 {
        return Err(Error::new(ErrorKind::SdpNotFound));
    }
    Ok(())
}

/// Queries `peer` for the RFCOMM channel of its SPP service, returning the
/// channel from the last matching record (mirrors the original's
/// last-match semantics).
pub fn find_spp_channel(peer: Address) -> Result<u8> {
    let session = SdpSession::connect(address_to_bdaddr(peer))?;

    let mut serial_class = uuid_t::default();
    unsafe { sdp_uuid16_create(&mut serial_class, SERIAL_PORT_CLASS) };
    let mut search = SdpList::new();
    search.append(&mut serial_class as *mut _ as *mut _);

    let mut attr_range: u32 = 0x0000_ffff;
    let mut attr_list = SdpList::new();
    attr_list.append(&mut attr_range as *mut _ as *mut _);

    let mut response: *mut sdp_list_t = ptr::null_mut();
    let rc = unsafe {
        sdp_service_search_attr_req(session.0, search.as_ptr(), 2 /* SDP_ATTR_REQ_RANGE */, attr_list.as_ptr(), &mut response)
    };
    if rc != 0 {
        return Err(Error::new(ErrorKind::SdpQueryFailed));
    }

    let mut found: Option<u8> = None;
    let mut cur = response;
    while !cur.is_null() {
        let rec = unsafe { (*cur).data as *mut sdp_record_t };
        let mut protos: *mut sdp_list_t = ptr::null_mut();
        if unsafe { sdp_get_access_protos(rec, &mut protos) } == 0 {
            let port = unsafe { sdp_get_proto_port(protos, RFCOMM_UUID as c_int) };
            if port > 0 {
                found = Some(port as u8);
            }
            unsafe { sdp_list_free(protos, None) };
        }
        cur = unsafe { (*cur).next };
    }
    unsafe { sdp_list_free(response, None) };

    found.ok_or_else(|| Error::new(ErrorKind::SdpQueryFailed))
}
