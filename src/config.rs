/// Protocol-defined default values for the recognized settings.
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 0;
pub const DEFAULT_MAX_FIELD_SECTION_SIZE: u32 = u32::MAX;
pub const DEFAULT_QPACK_BLOCKED_STREAMS: u32 = 0;
pub const DEFAULT_NUM_PLACEHOLDERS: u32 = 0;
pub const DEFAULT_MAX_SETTINGS: u32 = 10;

/// Engine configuration. Defaults match the protocol-defined values, which
/// a deployment overrides to enable the dynamic table and blocked decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Advertised as SETTINGS HEADER_TABLE_SIZE.
    pub header_table_size: u32,
    /// Advertised as SETTINGS MAX_FIELD_SECTION_SIZE.
    pub max_field_section_size: u32,
    /// Advertised as SETTINGS QPACK_BLOCKED_STREAMS.
    pub qpack_blocked_streams: u32,
    /// Advertised as SETTINGS NUM_PLACEHOLDERS; only sent when serving.
    pub num_placeholders: u32,
    /// Cap on the number of pairs accepted from a peer's SETTINGS frame.
    pub max_settings: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_field_section_size: DEFAULT_MAX_FIELD_SECTION_SIZE,
            qpack_blocked_streams: DEFAULT_QPACK_BLOCKED_STREAMS,
            num_placeholders: DEFAULT_NUM_PLACEHOLDERS,
            max_settings: DEFAULT_MAX_SETTINGS,
        }
    }
}
