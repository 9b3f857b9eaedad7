//! OBD-II Protocol Implementation
//!
//! This crate speaks the ELM327 line protocol: request framing and reply
//! parsing, adapter bring-up and baud negotiation, supported-PID discovery,
//! trouble-code conversion and the per-bus header formats. Both the logger
//! and the adapter simulator build on it.

mod capability;
mod client;
mod codec;
mod dtc;
mod error;
mod pid;
mod protocol;
mod seriallog;
mod transport;

pub use capability::{discover, CapabilityBitmap};
pub use client::{
    BaudSetting, ErrorCodes, ObdClient, RequesterState, DEFAULT_TIMEOUT, GUESS_BAUD_RATES,
    UPGRADE_BAUD_RATES,
};
pub use codec::{
    decode_response, encode_command, is_reply_complete, join_lines, mode_has_pid, scan_hex_pairs,
    scan_request, ObdReply, ObdRequest, MAX_DATA_BYTES, PROMPT,
};
pub use dtc::{decode_dtc, dtcs_from_bytes, encode_dtc, DtcCategory, DtcCode};
pub use error::{ObdError, ObdStatus};
pub use pid::{CmdDescriptor, Conversion, PidCatalog};
pub use protocol::{render_header, HeaderType, ObdProtocol, ProtocolSelection};
pub use seriallog::{Direction, SerialLog};
pub use transport::{SerialTransport, StreamTransport, Transport};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
}
