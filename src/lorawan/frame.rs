//! LoRaWAN 1.0.2 frame layouts
//!
//! `MHDR | FHDR | FPort | FRMPayload | MIC` for data frames and the fixed
//! join-request / join-accept layouts. Decoding is bounds-checked and fails
//! with [`Error::LengthError`] instead of reading past the input.

use heapless::Vec;

use crate::config::device::{DevAddr, EUI64};
use crate::crypto::MIC_SIZE;
use crate::error::{Error, Result};

/// Maximum FOpts length
pub const MAX_FOPTS_LEN: usize = 15;

/// MHDR + FHDR without FOpts
pub const FRAME_HEADER_LEN: usize = 1 + 7;

/// Join request length including MHDR and MIC
pub const JOIN_REQUEST_LEN: usize = 23;

/// Join accept length without CFList, including MHDR and MIC
pub const JOIN_ACCEPT_LEN: usize = 17;

/// Join accept length with a CFList
pub const JOIN_ACCEPT_CFLIST_LEN: usize = 33;

/// MAC header types
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MType {
    /// Join request
    JoinRequest = 0x00,
    /// Join accept
    JoinAccept = 0x20,
    /// Unconfirmed uplink
    UnconfirmedDataUp = 0x40,
    /// Unconfirmed downlink
    UnconfirmedDataDown = 0x60,
    /// Confirmed uplink
    ConfirmedDataUp = 0x80,
    /// Confirmed downlink
    ConfirmedDataDown = 0xA0,
    /// Reserved (rejoin in later versions)
    Rfu = 0xC0,
    /// Proprietary frame
    Proprietary = 0xE0,
}

impl MType {
    fn from_bits(byte: u8) -> Self {
        match byte & 0xE0 {
            0x00 => MType::JoinRequest,
            0x20 => MType::JoinAccept,
            0x40 => MType::UnconfirmedDataUp,
            0x60 => MType::UnconfirmedDataDown,
            0x80 => MType::ConfirmedDataUp,
            0xA0 => MType::ConfirmedDataDown,
            0xC0 => MType::Rfu,
            _ => MType::Proprietary,
        }
    }
}

/// Major version carried in MHDR
pub const MAJOR_LORAWAN_R1: u8 = 0;

/// MAC header
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mhdr {
    /// Message type
    pub mtype: MType,
    /// Major version
    pub major: u8,
}

impl Mhdr {
    /// Header for `mtype` at LoRaWAN R1
    pub fn new(mtype: MType) -> Self {
        Self {
            mtype,
            major: MAJOR_LORAWAN_R1,
        }
    }

    /// Wire representation
    pub fn to_byte(self) -> u8 {
        self.mtype as u8 | (self.major & 0x03)
    }

    /// Decode the wire representation
    pub fn from_byte(byte: u8) -> Self {
        Self {
            mtype: MType::from_bits(byte),
            major: byte & 0x03,
        }
    }
}

/// Frame header flags
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FCtrl {
    /// ADR enabled
    pub adr: bool,
    /// ADR acknowledgement requested (uplink)
    pub adr_ack_req: bool,
    /// Acknowledges the last confirmed frame
    pub ack: bool,
    /// Network has more data pending (downlink)
    pub f_pending: bool,
    /// FOpts length
    pub f_opts_len: u8,
}

impl FCtrl {
    /// Wire representation
    pub fn to_byte(&self) -> u8 {
        let mut byte = self.f_opts_len & 0x0F;
        if self.adr {
            byte |= 0x80;
        }
        if self.adr_ack_req {
            byte |= 0x40;
        }
        if self.ack {
            byte |= 0x20;
        }
        if self.f_pending {
            byte |= 0x10;
        }
        byte
    }

    /// Decode the wire representation
    pub fn from_byte(byte: u8) -> Self {
        Self {
            adr: (byte & 0x80) != 0,
            adr_ack_req: (byte & 0x40) != 0,
            ack: (byte & 0x20) != 0,
            f_pending: (byte & 0x10) != 0,
            f_opts_len: byte & 0x0F,
        }
    }
}

/// Frame header
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fhdr {
    /// Device address
    pub dev_addr: DevAddr,
    /// Frame control
    pub f_ctrl: FCtrl,
    /// Low 16 bits of the frame counter
    pub f_cnt: u16,
    /// Piggybacked MAC commands
    pub f_opts: Vec<u8, MAX_FOPTS_LEN>,
}

impl Fhdr {
    /// Append the wire representation to `out`
    pub fn serialize<const N: usize>(&self, out: &mut Vec<u8, N>) -> Result<()> {
        let mut f_ctrl = self.f_ctrl;
        f_ctrl.f_opts_len = self.f_opts.len() as u8;
        out.extend_from_slice(&self.dev_addr.to_le_bytes())
            .map_err(|_| Error::LengthError)?;
        out.push(f_ctrl.to_byte()).map_err(|_| Error::LengthError)?;
        out.extend_from_slice(&self.f_cnt.to_le_bytes())
            .map_err(|_| Error::LengthError)?;
        out.extend_from_slice(&self.f_opts)
            .map_err(|_| Error::LengthError)
    }
}

/// Decoded data frame, borrowing its payload from the receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame<'a> {
    /// MAC header
    pub mhdr: Mhdr,
    /// Frame header
    pub fhdr: Fhdr,
    /// FPort when present
    pub f_port: Option<u8>,
    /// Still-encrypted FRMPayload
    pub frm_payload: &'a [u8],
    /// Bytes covered by the MIC
    pub mic_input: &'a [u8],
    /// Received MIC
    pub mic: [u8; MIC_SIZE],
}

impl<'a> DataFrame<'a> {
    /// Split a data frame into its fields
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_LEN + MIC_SIZE {
            return Err(Error::LengthError);
        }
        let mhdr = Mhdr::from_byte(buf[0]);
        let (body, mic_bytes) = buf.split_at(buf.len() - MIC_SIZE);
        let dev_addr = DevAddr::from_le_bytes([body[1], body[2], body[3], body[4]]);
        let f_ctrl = FCtrl::from_byte(body[5]);
        let f_cnt = u16::from_le_bytes([body[6], body[7]]);
        let opts_end = FRAME_HEADER_LEN + f_ctrl.f_opts_len as usize;
        let f_opts = body
            .get(FRAME_HEADER_LEN..opts_end)
            .ok_or(Error::LengthError)?;

        let (f_port, frm_payload) = match body.get(opts_end) {
            Some(port) => (Some(*port), &body[opts_end + 1..]),
            None => (None, &body[opts_end..]),
        };

        let mut mic = [0u8; MIC_SIZE];
        mic.copy_from_slice(mic_bytes);

        Ok(Self {
            mhdr,
            fhdr: Fhdr {
                dev_addr,
                f_ctrl,
                f_cnt,
                f_opts: Vec::from_slice(f_opts).map_err(|_| Error::LengthError)?,
            },
            f_port,
            frm_payload,
            mic_input: body,
            mic,
        })
    }
}

/// Join request up to and including DevNonce; the MIC is appended by the caller
pub fn join_request_body(app_eui: &EUI64, dev_eui: &EUI64, dev_nonce: u16) -> Vec<u8, JOIN_REQUEST_LEN> {
    let mut buf: Vec<u8, JOIN_REQUEST_LEN> = Vec::new();
    // Capacity covers MHDR + 18 bytes + MIC.
    let _ = buf.push(Mhdr::new(MType::JoinRequest).to_byte());
    let _ = buf.extend_from_slice(app_eui);
    let _ = buf.extend_from_slice(dev_eui);
    let _ = buf.extend_from_slice(&dev_nonce.to_le_bytes());
    buf
}

/// Decrypted join accept fields
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAccept {
    /// Server nonce
    pub app_nonce: [u8; 3],
    /// Network identifier
    pub net_id: [u8; 3],
    /// Assigned device address
    pub dev_addr: DevAddr,
    /// RX1 datarate offset
    pub rx1_dr_offset: u8,
    /// RX2 datarate
    pub rx2_datarate: u8,
    /// RX1 delay in seconds (0 means 1)
    pub rx_delay: u8,
    /// Optional channel list
    pub cf_list: Option<[u8; 16]>,
}

impl JoinAccept {
    /// Parse a decrypted join accept, MHDR included and MIC excluded
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let body = match buf.len() + MIC_SIZE {
            JOIN_ACCEPT_LEN | JOIN_ACCEPT_CFLIST_LEN => &buf[1..],
            _ => return Err(Error::LengthError),
        };
        let cf_list = body.get(12..28).map(|cf| {
            let mut list = [0u8; 16];
            list.copy_from_slice(cf);
            list
        });
        Ok(Self {
            app_nonce: [body[0], body[1], body[2]],
            net_id: [body[3], body[4], body[5]],
            dev_addr: DevAddr::from_le_bytes([body[6], body[7], body[8], body[9]]),
            rx1_dr_offset: (body[10] >> 4) & 0x07,
            rx2_datarate: body[10] & 0x0F,
            rx_delay: body[11] & 0x0F,
            cf_list,
        })
    }

    /// NetID as an integer
    pub fn net_id_value(&self) -> u32 {
        u32::from_le_bytes([self.net_id[0], self.net_id[1], self.net_id[2], 0])
    }
}

/// Rebuild the 32-bit downlink counter from its low 16 bits.
///
/// Fails with [`Error::ParameterInvalid`] for a repeated frame and with
/// [`Error::LengthError`] when `max_gap` or more frames were lost.
pub fn reconstruct_fcnt(last: Option<u32>, received: u16, max_gap: u32) -> Result<u32> {
    let Some(last) = last else {
        return Ok(u32::from(received));
    };
    let mut candidate = (last & 0xFFFF_0000) | u32::from(received);
    if candidate < last {
        candidate = candidate.wrapping_add(0x1_0000);
    }
    if candidate == last {
        return Err(Error::ParameterInvalid);
    }
    if candidate - last >= max_gap {
        return Err(Error::LengthError);
    }
    Ok(candidate)
}
