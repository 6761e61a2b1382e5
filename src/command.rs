// MIT License - Copyright (c) 2026 Peter Wright
// Command set

use crate::constants::{
    CMD_BUZ, CMD_CAP, CMD_COMSET, CMD_ID, CMD_ISTAT, CMD_KEYSET, CMD_LED, CMD_LSTAT, CMD_MFG,
    CMD_OSTAT, CMD_OUT, CMD_PIVDATA, CMD_RSTAT, CMD_TEXT, CMD_XWR,
};
use crate::reply::ReplyType;

/// Output control codes for the osdp_OUT command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputControlCode {
    Nop = 0x00,
    PermanentOffAbortTimed = 0x01,
    PermanentOnAbortTimed = 0x02,
    PermanentOffAllowTimed = 0x03,
    PermanentOnAllowTimed = 0x04,
    TimedOn = 0x05,
    TimedOff = 0x06,
}

/// LED colors a reader can display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LedColor {
    Black = 0,
    Red = 1,
    Green = 2,
    Amber = 3,
    Blue = 4,
}

/// Permanent LED state for the osdp_LED command.
#[derive(Debug, Clone, Copy)]
pub struct LedControl {
    pub reader: u8,
    pub led: u8,
    pub on_color: LedColor,
    pub off_color: LedColor,
    /// On time in 100 ms units.
    pub on_time: u8,
    /// Off time in 100 ms units.
    pub off_time: u8,
}

/// Selector for a PIV object on the PD.
#[derive(Debug, Clone, Copy)]
pub struct PivDataSelector {
    pub object_id: [u8; 3],
    pub element_id: u8,
    pub data_offset: u16,
}

/// Commands an ACU can issue to a PD.
///
/// Secure channel establishment traffic (CHLNG/SCRYPT) is not part of this
/// set; the device proxy generates those frames itself.
#[derive(Debug, Clone)]
pub enum Command {
    /// osdp_ID — Request the PD identification report
    IdReport,
    /// osdp_CAP — Request the PD capabilities report
    DeviceCapabilities,
    /// osdp_LSTAT — Request tamper/power status
    LocalStatusReport,
    /// osdp_ISTAT — Request input point status
    InputStatusReport,
    /// osdp_OSTAT — Request output point status
    OutputStatusReport,
    /// osdp_RSTAT — Request attached-reader status
    ReaderStatusReport,
    /// osdp_OUT — Drive an output point
    OutputControl {
        output: u8,
        control: OutputControlCode,
        /// Timer in 100 ms units, for the timed control codes.
        timer: u16,
    },
    /// osdp_LED — Set a reader LED
    ReaderLedControl(LedControl),
    /// osdp_BUZ — Sound the reader buzzer
    ReaderBuzzerControl {
        reader: u8,
        /// 100 ms units.
        on_time: u8,
        /// 100 ms units.
        off_time: u8,
        count: u8,
    },
    /// osdp_TEXT — Show text on the reader display
    TextOutput {
        reader: u8,
        row: u8,
        column: u8,
        text: String,
    },
    /// osdp_COMSET — Reassign the PD address and baud rate
    CommunicationConfig { address: u8, baud_rate: u32 },
    /// osdp_KEYSET — Install a new secure channel base key
    KeySet { key: [u8; 16] },
    /// osdp_MFG — Vendor-specific command
    ManufacturerSpecific { vendor_code: [u8; 3], data: Vec<u8> },
    /// osdp_XWR — Extended write
    ExtendedWrite { mode: u8, command: u8, data: Vec<u8> },
    /// osdp_PIVDATA — Request a PIV object; the reply arrives in fragments
    GetPivData(PivDataSelector),
}

impl Command {
    /// The wire command code.
    pub fn code(&self) -> u8 {
        match self {
            Command::IdReport => CMD_ID,
            Command::DeviceCapabilities => CMD_CAP,
            Command::LocalStatusReport => CMD_LSTAT,
            Command::InputStatusReport => CMD_ISTAT,
            Command::OutputStatusReport => CMD_OSTAT,
            Command::ReaderStatusReport => CMD_RSTAT,
            Command::OutputControl { .. } => CMD_OUT,
            Command::ReaderLedControl(_) => CMD_LED,
            Command::ReaderBuzzerControl { .. } => CMD_BUZ,
            Command::TextOutput { .. } => CMD_TEXT,
            Command::CommunicationConfig { .. } => CMD_COMSET,
            Command::KeySet { .. } => CMD_KEYSET,
            Command::ManufacturerSpecific { .. } => CMD_MFG,
            Command::ExtendedWrite { .. } => CMD_XWR,
            Command::GetPivData(_) => CMD_PIVDATA,
        }
    }

    /// Encode the command data bytes (everything after the code byte).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            // ID and CAP take a one-byte "standard format" selector; the
            // status report requests carry no data at all.
            Command::IdReport | Command::DeviceCapabilities => vec![0x00],
            Command::LocalStatusReport
            | Command::InputStatusReport
            | Command::OutputStatusReport
            | Command::ReaderStatusReport => Vec::new(),
            Command::OutputControl {
                output,
                control,
                timer,
            } => {
                let timer = timer.to_le_bytes();
                vec![*output, *control as u8, timer[0], timer[1]]
            }
            Command::ReaderLedControl(led) => {
                // Temporary settings zeroed, permanent block set.
                vec![
                    led.reader,
                    led.led,
                    0x00,
                    0x00,
                    0x00,
                    0x00,
                    0x00,
                    0x00,
                    0x00,
                    0x01,
                    led.on_time,
                    led.off_time,
                    led.on_color as u8,
                    led.off_color as u8,
                ]
            }
            Command::ReaderBuzzerControl {
                reader,
                on_time,
                off_time,
                count,
            } => vec![*reader, 0x02, *on_time, *off_time, *count],
            Command::TextOutput {
                reader,
                row,
                column,
                text,
            } => {
                let mut data = vec![
                    *reader,
                    0x01,
                    0x00,
                    *row,
                    *column,
                    text.len().min(u8::MAX as usize) as u8,
                ];
                data.extend_from_slice(text.as_bytes());
                data
            }
            Command::CommunicationConfig { address, baud_rate } => {
                let baud = baud_rate.to_le_bytes();
                vec![*address, baud[0], baud[1], baud[2], baud[3]]
            }
            Command::KeySet { key } => {
                let mut data = vec![0x01, key.len() as u8];
                data.extend_from_slice(key);
                data
            }
            Command::ManufacturerSpecific { vendor_code, data } => {
                let mut out = vendor_code.to_vec();
                out.extend_from_slice(data);
                out
            }
            Command::ExtendedWrite {
                mode,
                command,
                data,
            } => {
                let mut out = vec![*mode, *command];
                out.extend_from_slice(data);
                out
            }
            Command::GetPivData(selector) => {
                let offset = selector.data_offset.to_le_bytes();
                let mut out = selector.object_id.to_vec();
                out.push(selector.element_id);
                out.extend_from_slice(&offset);
                out
            }
        }
    }

    /// Whether `reply` is an acceptable correlated reply for this command.
    ///
    /// ACK and NAK close out any command; everything else must appear in
    /// the command's row of the reply-for-command table. Replies outside
    /// the table are unsolicited and never complete a pending request.
    pub fn accepts(&self, reply: ReplyType) -> bool {
        if matches!(reply, ReplyType::Ack | ReplyType::Nak) {
            return true;
        }
        match self {
            Command::IdReport => reply == ReplyType::IdReport,
            Command::DeviceCapabilities => reply == ReplyType::DeviceCapabilities,
            Command::LocalStatusReport => reply == ReplyType::LocalStatus,
            Command::InputStatusReport => reply == ReplyType::InputStatus,
            Command::OutputStatusReport => reply == ReplyType::OutputStatus,
            Command::ReaderStatusReport => reply == ReplyType::ReaderStatus,
            Command::OutputControl { .. } => reply == ReplyType::OutputStatus,
            Command::ManufacturerSpecific { .. } => reply == ReplyType::ManufacturerSpecific,
            Command::ExtendedWrite { .. } => reply == ReplyType::ExtendedRead,
            Command::GetPivData(_) => reply == ReplyType::PivData,
            Command::ReaderLedControl(_)
            | Command::ReaderBuzzerControl { .. }
            | Command::TextOutput { .. }
            | Command::CommunicationConfig { .. }
            | Command::KeySet { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::IdReport.code(), 0x61);
        assert_eq!(Command::DeviceCapabilities.code(), 0x62);
        assert_eq!(
            Command::OutputControl {
                output: 0,
                control: OutputControlCode::TimedOn,
                timer: 30,
            }
            .code(),
            0x68
        );
        assert_eq!(
            Command::GetPivData(PivDataSelector {
                object_id: [0x5F, 0xC1, 0x02],
                element_id: 0,
                data_offset: 0,
            })
            .code(),
            0xA3
        );
    }

    #[test]
    fn test_output_control_encoding() {
        let cmd = Command::OutputControl {
            output: 2,
            control: OutputControlCode::TimedOn,
            timer: 0x0102,
        };
        assert_eq!(cmd.encode(), vec![0x02, 0x05, 0x02, 0x01]);
    }

    #[test]
    fn test_comset_encoding() {
        let cmd = Command::CommunicationConfig {
            address: 0x05,
            baud_rate: 9600,
        };
        assert_eq!(cmd.encode(), vec![0x05, 0x80, 0x25, 0x00, 0x00]);
    }

    #[test]
    fn test_keyset_encoding() {
        let key = [0xAA; 16];
        let data = Command::KeySet { key }.encode();
        assert_eq!(data[0], 0x01);
        assert_eq!(data[1], 16);
        assert_eq!(&data[2..], &key);
    }

    #[test]
    fn test_piv_selector_encoding() {
        let cmd = Command::GetPivData(PivDataSelector {
            object_id: [0x5F, 0xC1, 0x02],
            element_id: 1,
            data_offset: 0x1234,
        });
        assert_eq!(cmd.encode(), vec![0x5F, 0xC1, 0x02, 0x01, 0x34, 0x12]);
    }

    #[test]
    fn test_reply_table_rows() {
        assert!(Command::IdReport.accepts(ReplyType::IdReport));
        assert!(Command::IdReport.accepts(ReplyType::Nak));
        assert!(!Command::IdReport.accepts(ReplyType::DeviceCapabilities));

        let out = Command::OutputControl {
            output: 0,
            control: OutputControlCode::Nop,
            timer: 0,
        };
        assert!(out.accepts(ReplyType::OutputStatus));
        assert!(out.accepts(ReplyType::Ack));
        assert!(!out.accepts(ReplyType::RawCardData));

        // LED/buzzer/text/comset accept only ACK/NAK.
        let led = Command::ReaderLedControl(LedControl {
            reader: 0,
            led: 0,
            on_color: LedColor::Green,
            off_color: LedColor::Black,
            on_time: 0,
            off_time: 0,
        });
        assert!(led.accepts(ReplyType::Ack));
        assert!(!led.accepts(ReplyType::OutputStatus));

        // Unsolicited-only types never correlate.
        assert!(!Command::LocalStatusReport.accepts(ReplyType::RawCardData));
        assert!(!Command::GetPivData(PivDataSelector {
            object_id: [0; 3],
            element_id: 0,
            data_offset: 0,
        })
        .accepts(ReplyType::KeypadData));
    }
}
