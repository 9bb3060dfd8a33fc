use std::collections::BTreeMap;

use bytes::BufMut;

use crate::{ErrorCode, Http3Error, VarInt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SettingsId(pub VarInt);

macro_rules! settings_ids {
    {$($name:ident = $val:expr,)*} => {
        impl SettingsId {
            $(pub const $name: SettingsId = SettingsId(VarInt::from_u32($val));)*
        }
    }
}

settings_ids! {
    HEADER_TABLE_SIZE = 0x01,
    MAX_FIELD_SECTION_SIZE = 0x06,
    QPACK_BLOCKED_STREAMS = 0x07,
    NUM_PLACEHOLDERS = 0x09,

    // Sent with every SETTINGS frame so peers get to exercise the
    // ignore-unknown-identifiers requirement.
    GREASE = 0x0a0a,
}

impl SettingsId {
    pub fn is_recognized(self) -> bool {
        matches!(
            self,
            SettingsId::HEADER_TABLE_SIZE
                | SettingsId::MAX_FIELD_SECTION_SIZE
                | SettingsId::QPACK_BLOCKED_STREAMS
                | SettingsId::NUM_PLACEHOLDERS
        )
    }
}

/// A SETTINGS frame payload: recognized (id, value) pairs. Unknown ids are
/// dropped at parse time; parse failures are carried alongside the pairs so
/// the handler decides what to do with them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsFrame {
    settings: BTreeMap<SettingsId, u64>,
    error: Option<Http3Error>,
}

impl SettingsFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a complete SETTINGS payload. At most `max_settings` recognized
    /// pairs are accepted before the frame is flagged with
    /// H3_EXCESSIVE_LOAD; truncated pairs flag H3_SETTINGS_ERROR.
    pub fn parse(payload: &[u8], max_settings: u32) -> Self {
        let mut frame = SettingsFrame::new();
        let mut buf = payload;
        let mut nsettings: u32 = 0;

        while !buf.is_empty() {
            if nsettings >= max_settings {
                frame.error = Some(Http3Error::connection(
                    ErrorCode::H3ExcessiveLoad,
                    "too many settings",
                ));
                return frame;
            }

            let id = match VarInt::decode(&mut buf) {
                Ok(id) => id,
                Err(_) => {
                    frame.error = Some(Http3Error::connection(
                        ErrorCode::H3SettingsError,
                        "invalid SETTINGS frame",
                    ));
                    return frame;
                }
            };
            let value = match VarInt::decode(&mut buf) {
                Ok(value) => value,
                Err(_) => {
                    frame.error = Some(Http3Error::connection(
                        ErrorCode::H3SettingsError,
                        "invalid SETTINGS frame",
                    ));
                    return frame;
                }
            };

            let id = SettingsId(id);
            if !id.is_recognized() {
                continue;
            }

            frame.settings.insert(id, value.into_inner());
            nsettings += 1;
        }

        frame
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<Http3Error> {
        self.error
    }

    pub fn contains(&self, id: SettingsId) -> bool {
        self.settings.contains_key(&id)
    }

    pub fn get(&self, id: SettingsId) -> Option<u64> {
        self.settings.get(&id).copied()
    }

    pub fn set(&mut self, id: SettingsId, value: u64) {
        self.settings.insert(id, value);
    }

    pub fn payload_len(&self) -> u64 {
        let mut len = 0u64;
        for (id, value) in &self.settings {
            len += id.0.size() as u64;
            len += VarInt::from_u64(*value).map_or(8, |v| v.size()) as u64;
        }
        len += SettingsId::GREASE.0.size() as u64 + 1;
        len
    }

    pub fn encode_payload<B: BufMut>(&self, buf: &mut B) {
        for (id, value) in &self.settings {
            id.0.encode(buf);
            VarInt::from_u64(*value)
                .expect("setting value fits a varint")
                .encode(buf);
        }
        SettingsId::GREASE.0.encode(buf);
        VarInt::from_u32(0).encode(buf);
    }
}
