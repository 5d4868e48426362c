//! Per-device endpoint table.
//!
//! The table mirrors the endpoint layout of the device's active configuration
//! and alternate settings: a singleton control endpoint 0 plus independent IN
//! and OUT slots for endpoints `1..NUM_ENDPOINT`. It is rebuilt whenever the
//! guest changes the configuration or an alternate setting.

use crate::transport::ConfigDescriptor;
use crate::MAX_INTERFACE;

/// Endpoint slots per direction, control endpoint 0 excluded.
pub const NUM_ENDPOINT: usize = 16;

/// Transfer direction, from the host's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dir {
    Out,
    In,
}

impl Dir {
    /// Direction encoded in bit 7 of an endpoint address.
    pub fn from_ep_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Dir::In
        } else {
            Dir::Out
        }
    }
}

/// Endpoint transfer type, `bmAttributes` bits 0..2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpType {
    Control,
    Isoc,
    Bulk,
    Interrupt,
    /// Slot not populated by the active configuration.
    Invalid,
}

impl EpType {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => EpType::Control,
            1 => EpType::Isoc,
            2 => EpType::Bulk,
            _ => EpType::Interrupt,
        }
    }
}

/// Packet size portion of a packed `wMaxPacketSize` word.
pub fn maxp_size(maxp: u16) -> u32 {
    u32::from(maxp & 0x07ff)
}

/// Additional transactions per microframe, `wMaxPacketSize` bits 11..13.
pub fn maxp_mult(maxp: u16) -> u32 {
    u32::from((maxp >> 11) & 0x03)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub pid: Dir,
    pub kind: EpType,
    pub maxp: u16,
}

/// Endpoint table for one attached device.
///
/// Slots are keyed by endpoint number and direction only; when several
/// interfaces share an endpoint number the later one wins. Alternate settings
/// are honored per interface via the recorded `alt_settings`.
pub struct EndpointTable {
    ep0: Endpoint,
    ep_in: [Endpoint; NUM_ENDPOINT],
    ep_out: [Endpoint; NUM_ENDPOINT],
}

impl EndpointTable {
    pub fn new() -> Self {
        let mut table = Self {
            ep0: Endpoint {
                pid: Dir::Out,
                kind: EpType::Control,
                maxp: 0,
            },
            ep_in: [Endpoint {
                pid: Dir::In,
                kind: EpType::Invalid,
                maxp: 0,
            }; NUM_ENDPOINT],
            ep_out: [Endpoint {
                pid: Dir::Out,
                kind: EpType::Invalid,
                maxp: 0,
            }; NUM_ENDPOINT],
        };
        table.reset();
        table
    }

    /// Return every slot to its reset state: EP0 control, all others invalid
    /// with their direction bound.
    pub fn reset(&mut self) {
        self.ep0.kind = EpType::Control;
        for ep in 0..NUM_ENDPOINT {
            self.ep_in[ep].pid = Dir::In;
            self.ep_in[ep].kind = EpType::Invalid;
            self.ep_out[ep].pid = Dir::Out;
            self.ep_out[ep].kind = EpType::Invalid;
        }
    }

    /// Endpoint 0 resolves to the control slot for either direction.
    pub fn get(&self, pid: Dir, epnum: u8) -> Option<&Endpoint> {
        let epnum = usize::from(epnum);
        if epnum >= NUM_ENDPOINT {
            return None;
        }
        if epnum == 0 {
            return Some(&self.ep0);
        }
        match pid {
            Dir::In => Some(&self.ep_in[epnum - 1]),
            Dir::Out => Some(&self.ep_out[epnum - 1]),
        }
    }

    fn get_mut(&mut self, pid: Dir, epnum: u8) -> Option<&mut Endpoint> {
        let epnum = usize::from(epnum);
        if epnum >= NUM_ENDPOINT {
            return None;
        }
        if epnum == 0 {
            return Some(&mut self.ep0);
        }
        match pid {
            Dir::In => Some(&mut self.ep_in[epnum - 1]),
            Dir::Out => Some(&mut self.ep_out[epnum - 1]),
        }
    }

    pub fn ep_type(&self, pid: Dir, epnum: u8) -> EpType {
        self.get(pid, epnum).map_or(EpType::Invalid, |ep| ep.kind)
    }

    pub fn ep_maxp(&self, pid: Dir, epnum: u8) -> u16 {
        self.get(pid, epnum).map_or(0, |ep| ep.maxp)
    }

    /// Populate slots from the active configuration descriptor, honoring the
    /// recorded alternate setting of each interface.
    pub fn update_from_config(&mut self, cfg: &ConfigDescriptor, alts: &[u8; MAX_INTERFACE]) {
        for (i, iface) in cfg.interfaces.iter().enumerate() {
            let alt = alts.get(i).copied().unwrap_or(0);
            let Some(setting) = iface.alt_settings.get(usize::from(alt)) else {
                continue;
            };
            for ep in &setting.endpoints {
                let pid = Dir::from_ep_address(ep.address);
                let epnum = ep.address & 0x0f;
                if let Some(slot) = self.get_mut(pid, epnum) {
                    slot.kind = EpType::from_attributes(ep.attributes);
                    slot.maxp = ep.max_packet_size;
                }
            }
        }
    }
}

impl Default for EndpointTable {
    fn default() -> Self {
        Self::new()
    }
}
