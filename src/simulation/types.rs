//! Type definitions shared across the simulation.
//!
//! Contains:
//! - Radio identities and device addresses
//! - The packet model with typed LoRaWAN frame headers and MAC commands
//! - The `Transmission` record handed from a PHY to the propagation channel

use std::fmt;
use std::time::Duration;

use super::signal_calculations::LoraTxParameters;

/// Size of the MAC header (MHDR) in bytes.
pub const MAC_HEADER_SIZE: usize = 1;
/// Fixed part of the frame header: DevAddr (4), FCtrl (1), FCnt (2).
pub const FRAME_HEADER_BASE_SIZE: usize = 7;
/// Frame port field.
pub const FRAME_PORT_SIZE: usize = 1;
/// Message integrity code appended to every frame.
pub const MIC_SIZE: usize = 4;
/// Maximum length of the FOpts field.
pub const MAX_FOPTS_SIZE: usize = 15;

/// Identity of a radio inside the simulation, by index into the world's node lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioId {
    EndDevice(usize),
    Gateway(usize),
}

impl fmt::Display for RadioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioId::EndDevice(i) => write!(f, "ed{}", i),
            RadioId::Gateway(i) => write!(f, "gw{}", i),
        }
    }
}

/// 32-bit LoRaWAN device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(pub u32);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    UnconfirmedDataUp,
    ConfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataDown,
}

impl MessageType {
    pub fn is_confirmed(self) -> bool {
        matches!(self, MessageType::ConfirmedDataUp | MessageType::ConfirmedDataDown)
    }
}

/// LoRaWAN MAC commands carried in FOpts.
///
/// Field encodings follow LoRaWAN 1.0: data rates and power are table indices,
/// frequencies are in Hz, `max_duty_cycle` is the exponent n of `1 / 2^n`.
#[derive(Debug, Clone, PartialEq)]
pub enum MacCommand {
    LinkCheckReq,
    LinkCheckAns { margin: u8, gateway_count: u8 },
    LinkAdrReq { data_rate: u8, tx_power: u8, enabled_channels: Vec<u8>, repetitions: u8 },
    LinkAdrAns { power_ack: bool, data_rate_ack: bool, channel_mask_ack: bool },
    DutyCycleReq { max_duty_cycle: u8 },
    DutyCycleAns,
    RxParamSetupReq { rx1_dr_offset: u8, rx2_data_rate: u8, frequency: u32 },
    RxParamSetupAns { rx1_dr_offset_ack: bool, rx2_data_rate_ack: bool, channel_ack: bool },
    DevStatusReq,
    DevStatusAns { battery: u8, margin: u8 },
    NewChannelReq { index: u8, frequency: u32, min_data_rate: u8, max_data_rate: u8 },
    NewChannelAns { data_rate_range_ok: bool, channel_frequency_ok: bool },
    RxTimingSetupReq { delay: u8 },
    RxTimingSetupAns,
    DlChannelReq { index: u8, frequency: u32 },
    DlChannelAns { uplink_frequency_exists: bool, channel_frequency_ok: bool },
}

impl MacCommand {
    /// Encoded length in bytes, command identifier included.
    pub fn encoded_len(&self) -> usize {
        match self {
            MacCommand::LinkCheckReq => 1,
            MacCommand::LinkCheckAns { .. } => 3,
            MacCommand::LinkAdrReq { .. } => 5,
            MacCommand::LinkAdrAns { .. } => 2,
            MacCommand::DutyCycleReq { .. } => 2,
            MacCommand::DutyCycleAns => 1,
            MacCommand::RxParamSetupReq { .. } => 5,
            MacCommand::RxParamSetupAns { .. } => 2,
            MacCommand::DevStatusReq => 1,
            MacCommand::DevStatusAns { .. } => 3,
            MacCommand::NewChannelReq { .. } => 6,
            MacCommand::NewChannelAns { .. } => 2,
            MacCommand::RxTimingSetupReq { .. } => 2,
            MacCommand::RxTimingSetupAns => 1,
            MacCommand::DlChannelReq { .. } => 5,
            MacCommand::DlChannelAns { .. } => 2,
        }
    }

    /// Answers that stay queued until the device hears a downlink.
    pub fn is_sticky_answer(&self) -> bool {
        matches!(self, MacCommand::DlChannelAns { .. } | MacCommand::RxTimingSetupAns)
    }
}

/// Typed LoRaWAN frame: the MAC header plus the frame header fields the
/// simulation acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message_type: MessageType,
    pub address: DeviceAddress,
    pub frame_counter: u16,
    pub ack: bool,
    pub adr: bool,
    pub adr_ack_req: bool,
    pub port: u8,
    pub commands: Vec<MacCommand>,
}

impl Frame {
    pub fn fopts_len(&self) -> usize {
        self.commands.iter().map(MacCommand::encoded_len).sum()
    }

    /// FHDR plus FPort.
    pub fn header_len(&self) -> usize {
        FRAME_HEADER_BASE_SIZE + self.fopts_len() + FRAME_PORT_SIZE
    }
}

/// A packet travelling through the simulated network.
///
/// `id` stays the same across retransmissions of one application payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: u64,
    pub payload_len: usize,
    pub frame: Option<Frame>,
}

impl Packet {
    pub fn new(id: u64, payload_len: usize) -> Self {
        Packet { id, payload_len, frame: None }
    }

    /// Size of FHDR + FPort + application payload.
    pub fn mac_payload_len(&self) -> usize {
        self.payload_len + self.frame.as_ref().map_or(0, Frame::header_len)
    }

    /// Size on air: MHDR + MAC payload + MIC once framed, the bare payload otherwise.
    pub fn size(&self) -> usize {
        match self.frame {
            Some(_) => MAC_HEADER_SIZE + self.mac_payload_len() + MIC_SIZE,
            None => self.payload_len,
        }
    }

    pub fn address(&self) -> Option<DeviceAddress> {
        self.frame.as_ref().map(|f| f.address)
    }
}

/// A packet leaving a radio, as handed to the propagation channel.
#[derive(Debug, Clone)]
pub struct Transmission {
    pub sender: RadioId,
    pub packet: Packet,
    pub params: LoraTxParameters,
    pub tx_power_dbm: f64,
    pub frequency: u32,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uplink(commands: Vec<MacCommand>) -> Frame {
        Frame {
            message_type: MessageType::UnconfirmedDataUp,
            address: DeviceAddress(0x0102_0304),
            frame_counter: 0,
            ack: false,
            adr: false,
            adr_ack_req: false,
            port: 1,
            commands,
        }
    }

    #[test]
    fn framed_packet_size_includes_headers_and_mic() {
        let mut packet = Packet::new(1, 10);
        assert_eq!(packet.size(), 10);
        packet.frame = Some(uplink(vec![]));
        assert_eq!(packet.mac_payload_len(), 18);
        assert_eq!(packet.size(), 10 + 1 + 8 + 4);
    }

    #[test]
    fn fopts_grow_the_header() {
        let frame = uplink(vec![
            MacCommand::LinkCheckReq,
            MacCommand::DevStatusAns { battery: 10, margin: 10 },
            MacCommand::LinkAdrAns { power_ack: true, data_rate_ack: true, channel_mask_ack: true },
        ]);
        assert_eq!(frame.fopts_len(), 6);
        assert_eq!(frame.header_len(), 14);
    }

    #[test]
    fn message_type_flags() {
        assert!(MessageType::ConfirmedDataUp.is_confirmed());
        assert!(!MessageType::UnconfirmedDataDown.is_confirmed());
    }

    #[test]
    fn radio_and_address_display() {
        assert_eq!(RadioId::Gateway(2).to_string(), "gw2");
        assert_eq!(RadioId::EndDevice(0).to_string(), "ed0");
        assert_eq!(DeviceAddress(0xab).to_string(), "000000ab");
    }
}
