//! Protocol constants: command and response codes, data packet flags, and the
//! operational-modes bitfield negotiated by `DefineOperationalModes`.

/// Commands a subscriber may send on the command channel.
pub mod server_command {
    pub const METADATA_REFRESH: u8 = 0x01;
    pub const SUBSCRIBE: u8 = 0x02;
    pub const UNSUBSCRIBE: u8 = 0x03;
    pub const ROTATE_CIPHER_KEYS: u8 = 0x04;
    pub const UPDATE_PROCESSING_INTERVAL: u8 = 0x05;
    pub const DEFINE_OPERATIONAL_MODES: u8 = 0x06;
    pub const CONFIRM_NOTIFICATION: u8 = 0x07;
    pub const CONFIRM_BUFFER_BLOCK: u8 = 0x08;
    pub const CONFIRM_UPDATE_BASE_TIMES: u8 = 0x09;
    pub const CONFIRM_UPDATE_SIGNAL_INDEX_CACHE: u8 = 0x0A;
    pub const USER_COMMAND_00: u8 = 0xD0;
    pub const USER_COMMAND_15: u8 = 0xDF;

    pub fn is_user_command(command: u8) -> bool {
        (USER_COMMAND_00..=USER_COMMAND_15).contains(&command)
    }

    pub fn name(command: u8) -> String {
        match command {
            METADATA_REFRESH => "MetadataRefresh".into(),
            SUBSCRIBE => "Subscribe".into(),
            UNSUBSCRIBE => "Unsubscribe".into(),
            ROTATE_CIPHER_KEYS => "RotateCipherKeys".into(),
            UPDATE_PROCESSING_INTERVAL => "UpdateProcessingInterval".into(),
            DEFINE_OPERATIONAL_MODES => "DefineOperationalModes".into(),
            CONFIRM_NOTIFICATION => "ConfirmNotification".into(),
            CONFIRM_BUFFER_BLOCK => "ConfirmBufferBlock".into(),
            CONFIRM_UPDATE_BASE_TIMES => "ConfirmUpdateBaseTimes".into(),
            CONFIRM_UPDATE_SIGNAL_INDEX_CACHE => "ConfirmUpdateSignalIndexCache".into(),
            command if is_user_command(command) => {
                format!("UserCommand{:02}", command - USER_COMMAND_00)
            }
            command => format!("0x{command:02X}"),
        }
    }
}

/// Responses the publisher may send on either channel.
pub mod server_response {
    pub const SUCCEEDED: u8 = 0x80;
    pub const FAILED: u8 = 0x81;
    pub const DATA_PACKET: u8 = 0x82;
    pub const UPDATE_SIGNAL_INDEX_CACHE: u8 = 0x83;
    pub const UPDATE_BASE_TIMES: u8 = 0x84;
    pub const UPDATE_CIPHER_KEYS: u8 = 0x85;
    pub const DATA_START_TIME: u8 = 0x86;
    pub const PROCESSING_COMPLETE: u8 = 0x87;
    pub const BUFFER_BLOCK: u8 = 0x88;
    pub const NOTIFY: u8 = 0x89;
    pub const CONFIGURATION_CHANGED: u8 = 0x8A;
    pub const NO_OP: u8 = 0xFF;

    pub fn name(response: u8) -> String {
        match response {
            SUCCEEDED => "Succeeded".into(),
            FAILED => "Failed".into(),
            DATA_PACKET => "DataPacket".into(),
            UPDATE_SIGNAL_INDEX_CACHE => "UpdateSignalIndexCache".into(),
            UPDATE_BASE_TIMES => "UpdateBaseTimes".into(),
            UPDATE_CIPHER_KEYS => "UpdateCipherKeys".into(),
            DATA_START_TIME => "DataStartTime".into(),
            PROCESSING_COMPLETE => "ProcessingComplete".into(),
            BUFFER_BLOCK => "BufferBlock".into(),
            NOTIFY => "Notify".into(),
            CONFIGURATION_CHANGED => "ConfigurationChanged".into(),
            NO_OP => "NoOP".into(),
            response => format!("0x{response:02X}"),
        }
    }
}

/// Leading flags byte of a data packet payload.
pub mod data_packet_flags {
    pub const NO_FLAGS: u8 = 0x00;
    pub const SYNCHRONIZED: u8 = 0x01;
    pub const COMPACT: u8 = 0x02;
    pub const CIPHER_INDEX: u8 = 0x04;
    pub const COMPRESSED: u8 = 0x08;
    pub const CACHE_INDEX: u8 = 0x10;
}

/// Bit layout of the 32-bit operational modes word.
///
/// The low byte carries the protocol version; the compression-algorithm
/// submask lives above it so a compression request can never corrupt the
/// version field.
pub mod operational_modes {
    pub const NO_FLAGS: u32 = 0x0000_0000;
    pub const VERSION_MASK: u32 = 0x0000_00FF;
    pub const ENCODING_MASK: u32 = 0x0000_0300;
    pub const COMPRESSION_MODE_MASK: u32 = 0x0000_E000;
    pub const RECEIVE_EXTERNAL_METADATA: u32 = 0x0200_0000;
    pub const RECEIVE_INTERNAL_METADATA: u32 = 0x0400_0000;
    pub const COMPRESS_PAYLOAD_DATA: u32 = 0x2000_0000;
    pub const COMPRESS_SIGNAL_INDEX_CACHE: u32 = 0x4000_0000;
    pub const COMPRESS_METADATA: u32 = 0x8000_0000;
}

/// Compression algorithms recognized inside `COMPRESSION_MODE_MASK`.
pub mod compression_modes {
    pub const NONE: u32 = 0x0000_0000;
    pub const GZIP: u32 = 0x0000_2000;
    pub const TSSC: u32 = 0x0000_4000;
}

/// Character encodings recognized inside `ENCODING_MASK`.
pub mod operational_encoding {
    pub const UTF8: u32 = 0x0000_0000;
    pub const UTF16LE: u32 = 0x0000_0100;
    pub const UTF16BE: u32 = 0x0000_0200;
}
