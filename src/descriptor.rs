//! In-flight configuration-descriptor rewrite.
//!
//! USB Attached SCSI is not supported; interface descriptors advertising the
//! UAS protocol are rewritten in the GET_DESCRIPTOR(CONFIGURATION) response so
//! the guest falls back to the mass-storage class driver.

use tracing::warn;

const DESC_TYPE_CONFIGURATION: u8 = 0x02;
const DESC_TYPE_INTERFACE: u8 = 0x04;
const INTERFACE_DESC_LEN: u8 = 9;
const PROTOCOL_UAS: u8 = 0x62;

/// Zero the `bInterfaceProtocol` field of any interface descriptor advertising
/// UAS (0x62) in a configuration-descriptor response buffer.
///
/// Per USB3 spec 9.6.5 (Standard Interface Descriptor): byte 0 is `bLength`,
/// byte 1 `bDescriptorType`, byte 7 `bInterfaceProtocol`. The walk follows
/// each descriptor's `bLength`; a zero length terminates it (malformed
/// descriptor stream).
pub fn clear_uas_protocol(data: &mut [u8]) {
    if data.len() < 2 || data[1] != DESC_TYPE_CONFIGURATION {
        return;
    }

    let mut i = 0usize;
    while i < data.len() {
        let len = data[i];
        if len == 0 {
            break;
        }
        if len == INTERFACE_DESC_LEN
            && i + 8 <= data.len()
            && data[i + 1] == DESC_TYPE_INTERFACE
            && data[i + 7] == PROTOCOL_UAS
        {
            warn!(offset = i, "clearing UAS interface protocol");
            data[i + 7] = 0;
        }
        i += usize::from(len);
    }
}
