//! QPACK header compression: a shared static table and a negotiated dynamic
//! table, synchronized over a pair of unidirectional streams.
//!
//! One `Qpack` instance plays one role per peer: the local instance encodes
//! header blocks and consumes the peer's decoder stream; the remote instance
//! decodes header blocks and consumes the peer's encoder stream. Decodes that
//! reference entries the table hasn't seen yet are parked on a blocked list
//! and resumed when the encoder stream catches up.

pub mod huffman;
pub mod prefix;
mod table;

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use log::{debug, trace};

use crate::{ByteChain, ErrorCode, FieldSection, HeaderField, Http3Error};

use prefix::PrefixError;
pub use table::{DynamicTable, LookupResult, MatchType, StaticTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QpackEvent {
    DecodeComplete { stream_id: u64, section: FieldSection },
    DecodeFailed { stream_id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The header block was decoded; a `DecodeComplete` event is queued.
    Done,
    /// The block references entries not yet inserted; it will be resumed
    /// from the encoder stream.
    Blocked,
}

/// Dynamic-table references taken by one encoded header block.
struct EntryReference {
    smallest: u64,
    largest: u64,
    referred: Vec<u64>,
}

/// A deferred decode, waiting for the dynamic table to catch up.
struct DecodeRequest {
    stream_id: u64,
    largest_reference: u64,
    header_block: Bytes,
}

pub struct Qpack {
    dynamic_table: DynamicTable,
    references: HashMap<u64, EntryReference>,
    max_field_section_size: u64,
    max_blocking_streams: usize,

    /// Largest dynamic-table index the peer's decoder has confirmed.
    largest_known_received_index: u64,

    blocked_list: VecDeque<DecodeRequest>,
    invalid: bool,

    // Outbound instructions awaiting a write-ready on their streams.
    encoder_instructions: ByteChain,
    decoder_instructions: ByteChain,

    // Inbound bytes that don't yet form a whole instruction.
    encoder_stream_inbound: ByteChain,
    decoder_stream_inbound: ByteChain,

    encoder_stream_id: Option<u64>,
    decoder_stream_id: Option<u64>,

    events: VecDeque<QpackEvent>,
}

impl Qpack {
    pub fn new(
        max_field_section_size: u64,
        max_table_size: usize,
        max_blocking_streams: usize,
    ) -> Self {
        Self {
            dynamic_table: DynamicTable::new(max_table_size),
            references: HashMap::new(),
            max_field_section_size,
            max_blocking_streams,
            largest_known_received_index: 0,
            blocked_list: VecDeque::new(),
            invalid: false,
            encoder_instructions: ByteChain::new(),
            decoder_instructions: ByteChain::new(),
            encoder_stream_inbound: ByteChain::new(),
            decoder_stream_inbound: ByteChain::new(),
            encoder_stream_id: None,
            decoder_stream_id: None,
            events: VecDeque::new(),
        }
    }

    pub fn set_encoder_stream(&mut self, stream_id: u64) {
        self.encoder_stream_id = Some(stream_id);
    }

    pub fn set_decoder_stream(&mut self, stream_id: u64) {
        self.decoder_stream_id = Some(stream_id);
    }

    pub fn encoder_stream_id(&self) -> Option<u64> {
        self.encoder_stream_id
    }

    pub fn decoder_stream_id(&self) -> Option<u64> {
        self.decoder_stream_id
    }

    pub fn update_max_field_section_size(&mut self, max: u64) {
        self.max_field_section_size = max;
    }

    /// Adopts a new table limit (from the peer's SETTINGS) and announces it
    /// on the encoder stream.
    pub fn update_max_table_size(&mut self, max: usize) {
        self.dynamic_table.update_size(max);
        self.write_dynamic_table_size_update(self.dynamic_table.max_size() as u64);
    }

    pub fn update_max_blocking_streams(&mut self, max: usize) {
        self.max_blocking_streams = max;
    }

    pub fn largest_known_received_index(&self) -> u64 {
        self.largest_known_received_index
    }

    pub fn inserted_count(&self) -> u64 {
        self.dynamic_table.inserted_count()
    }

    pub fn poll_event(&mut self) -> Option<QpackEvent> {
        self.events.pop_front()
    }

    /// Outbound encoder-stream instructions, to be flushed by the owner of
    /// the local QPACK encoder stream.
    pub fn drain_encoder_instructions(&mut self) -> ByteChain {
        std::mem::take(&mut self.encoder_instructions)
    }

    /// Outbound decoder-stream instructions (acknowledgements et al).
    pub fn drain_decoder_instructions(&mut self) -> ByteChain {
        std::mem::take(&mut self.decoder_instructions)
    }

    pub fn has_pending_instructions(&self) -> bool {
        !self.encoder_instructions.is_empty() || !self.decoder_instructions.is_empty()
    }

    //
    // Encoding
    //

    /// Compresses `section` into a header block for `stream_id`, queueing
    /// any table-update instructions on the encoder stream.
    pub fn encode(
        &mut self,
        stream_id: u64,
        section: &FieldSection,
        out: &mut Vec<u8>,
    ) -> Result<(), Http3Error> {
        let base_index = self.largest_known_received_index;

        let mut block = Vec::with_capacity(section.len() * 32);
        let mut referred = Vec::new();

        for field in section.iter() {
            if let Some(index) = self.encode_field(field, base_index, &mut block) {
                referred.push(index);
            }
        }

        let largest_reference = referred.iter().copied().max().unwrap_or(0);
        if !referred.is_empty() {
            let smallest = referred.iter().copied().min().unwrap_or(0);
            self.references.insert(
                stream_id,
                EntryReference {
                    smallest,
                    largest: largest_reference,
                    referred,
                },
            );
        }

        // Header Data Prefix: largest reference, then the base index as a
        // signed delta from it.
        prefix::encode_int(out, 8, 0, largest_reference);
        let (sign, delta) = if base_index < largest_reference {
            (1, largest_reference - base_index)
        } else {
            (0, base_index - largest_reference)
        };
        prefix::encode_int(out, 7, sign, delta);
        trace!(
            target: "qpack",
            "encoded header data prefix: largest_ref={}, base_index={}, delta={}",
            largest_reference,
            base_index,
            delta
        );

        out.extend_from_slice(&block);
        Ok(())
    }

    /// Encodes one field, inserting into the dynamic table when profitable.
    /// Returns the absolute index referenced, if the field line refers to
    /// the dynamic table.
    fn encode_field(
        &mut self,
        field: &HeaderField,
        base_index: u64,
        block: &mut Vec<u8>,
    ) -> Option<u64> {
        let name = field.name.as_str();
        let value = field.value.as_str();
        let never_index = field.never_index;

        let stat = StaticTable::lookup(name, value);
        let mut dynm = LookupResult::NONE;

        // Insert or duplicate ahead of encoding, so the field line can refer
        // to the freshest entry.
        if stat.match_type != MatchType::Exact {
            dynm = self.dynamic_table.lookup(name, value);
            match dynm.match_type {
                MatchType::Exact => {
                    if self.dynamic_table.should_duplicate(dynm.index) {
                        let current = dynm.index;
                        let duplicated = self.dynamic_table.duplicate(current);
                        if duplicated.match_type != MatchType::None {
                            self.write_duplicate(current);
                            dynm = duplicated;
                        }
                    }
                }
                _ if stat.match_type == MatchType::Name => {
                    if !never_index {
                        let inserted = self.dynamic_table.insert(name, value);
                        if inserted.match_type != MatchType::None {
                            self.write_insert_with_name_ref(stat.index, false, value);
                            dynm = inserted;
                        }
                    }
                }
                MatchType::Name => {
                    if !never_index {
                        let current = dynm.index;
                        let inserted = self.dynamic_table.insert(name, value);
                        if inserted.match_type != MatchType::None {
                            self.write_insert_with_name_ref(current, true, value);
                            dynm = inserted;
                        }
                    }
                }
                MatchType::None => {
                    let insert_value = if never_index { "" } else { value };
                    let inserted = self.dynamic_table.insert(name, insert_value);
                    if inserted.match_type != MatchType::None {
                        self.write_insert_without_name_ref(name, insert_value);
                        dynm = inserted;
                    }
                }
            }
        }

        if stat.match_type == MatchType::Exact {
            // Indexed Header Field, static table
            prefix::encode_int(block, 6, 0b11, stat.index);
            return None;
        }

        if dynm.match_type == MatchType::Exact {
            if dynm.index <= base_index {
                // Indexed Header Field, dynamic table (relative index)
                prefix::encode_int(block, 6, 0b10, base_index - dynm.index);
            } else {
                // Indexed Header Field With Post-Base Index
                prefix::encode_int(block, 4, 0b0001, dynm.index - base_index - 1);
            }
            self.dynamic_table.ref_entry(dynm.index);
            return Some(dynm.index);
        }

        if stat.match_type == MatchType::Name {
            // Literal With Name Reference, static table
            let flags = 0b0100 | (never_index as u8) << 1 | 0b0001;
            prefix::encode_int(block, 4, flags, stat.index);
            prefix::encode_string(block, 7, 0, value.as_bytes());
            return None;
        }

        if dynm.match_type == MatchType::Name {
            if dynm.index <= base_index {
                // Literal With Name Reference, dynamic table (relative index)
                let flags = 0b0100 | (never_index as u8) << 1;
                prefix::encode_int(block, 4, flags, base_index - dynm.index);
                prefix::encode_string(block, 7, 0, value.as_bytes());
            } else {
                // Literal With Post-Base Name Reference
                let flags = (never_index as u8) << 3 | 0b0000;
                prefix::encode_int(block, 3, flags, dynm.index - base_index - 1);
                prefix::encode_string(block, 7, 0, value.as_bytes());
            }
            self.dynamic_table.ref_entry(dynm.index);
            return Some(dynm.index);
        }

        // Literal Without Name Reference
        prefix::encode_string(block, 3, 0b0010 | never_index as u8, name.as_bytes());
        prefix::encode_string(block, 7, 0, value.as_bytes());
        None
    }

    //
    // Decoding
    //

    /// Decodes a header block received on `stream_id`. The outcome arrives
    /// as a `DecodeComplete` / `DecodeFailed` event; `Blocked` means the
    /// event will fire once the encoder stream catches up.
    pub fn decode(&mut self, stream_id: u64, header_block: Bytes) -> Result<DecodeStatus, Http3Error> {
        if self.invalid {
            return Err(Http3Error::stream(
                ErrorCode::QpackDecompressionFailed,
                "qpack instance is invalid",
            ));
        }

        let (largest_reference, _) = prefix::decode_int(&header_block, 8).map_err(|_| {
            Http3Error::stream(ErrorCode::QpackDecompressionFailed, "truncated header block")
        })?;

        if self.dynamic_table.inserted_count() < largest_reference {
            if self.blocked_list.len() >= self.max_blocking_streams {
                return Err(Http3Error::application(
                    ErrorCode::QpackDecompressionFailed,
                    "too many blocked streams",
                ));
            }
            debug!(
                target: "qpack",
                "decode blocked: stream_id={}, largest_ref={}, inserted={}",
                stream_id,
                largest_reference,
                self.dynamic_table.inserted_count()
            );
            self.blocked_list.push_back(DecodeRequest {
                stream_id,
                largest_reference,
                header_block,
            });
            return Ok(DecodeStatus::Blocked);
        }

        self.decode_now(stream_id, &header_block);
        Ok(DecodeStatus::Done)
    }

    /// Cancels any pending decode for the stream and tells the peer's
    /// encoder with a Stream Cancellation instruction.
    pub fn cancel(&mut self, stream_id: u64) {
        self.blocked_list.retain(|r| r.stream_id != stream_id);
        self.write_stream_cancellation(stream_id);
    }

    fn decode_now(&mut self, stream_id: u64, header_block: &[u8]) {
        match self.decode_header_block(header_block) {
            Ok(section) => {
                self.write_header_acknowledgement(stream_id);
                self.events
                    .push_back(QpackEvent::DecodeComplete { stream_id, section });
            }
            Err(err) => {
                debug!(target: "qpack", "decoding header failed: {}", err);
                self.events.push_back(QpackEvent::DecodeFailed { stream_id });
            }
        }
    }

    fn decode_header_block(&self, block: &[u8]) -> Result<FieldSection, Http3Error> {
        let failed = Http3Error::stream(
            ErrorCode::QpackDecompressionFailed,
            "malformed header block",
        );

        let (largest_reference, mut pos) = prefix::decode_int(block, 8).map_err(|_| failed)?;

        let sign = *block.get(pos).ok_or(failed)? & 0x80 != 0;
        let (delta, n) = prefix::decode_int(&block[pos..], 7).map_err(|_| failed)?;
        pos += n;
        let base_index = if sign {
            if delta == 0 {
                return Err(failed);
            }
            largest_reference.checked_sub(delta).ok_or(failed)?
        } else {
            largest_reference + delta
        };

        let mut section = FieldSection::new();
        let mut section_size = 0u64;

        while pos < block.len() {
            let first = block[pos];
            let rest = &block[pos..];

            let (field, consumed) = if first & 0x80 != 0 {
                self.decode_indexed(rest, base_index)?
            } else if first & 0x40 != 0 {
                self.decode_literal_with_name_ref(rest, base_index)?
            } else if first & 0x20 != 0 {
                Self::decode_literal(rest)?
            } else if first & 0x10 != 0 {
                self.decode_indexed_postbase(rest, base_index)?
            } else {
                self.decode_literal_with_postbase_name_ref(rest, base_index)?
            };

            section_size += field.size() as u64;
            if section_size > self.max_field_section_size {
                return Err(Http3Error::stream(
                    ErrorCode::QpackDecompressionFailed,
                    "field section too large",
                ));
            }

            section.push(field);
            pos += consumed;
        }

        Ok(section)
    }

    fn resolve_relative(&self, base_index: u64, relative: u64) -> Result<(&str, &str), Http3Error> {
        let failed = Http3Error::stream(
            ErrorCode::QpackDecompressionFailed,
            "dynamic table reference out of range",
        );
        let absolute = base_index.checked_sub(relative).ok_or(failed)?;
        self.dynamic_table.lookup_index(absolute).ok_or(failed)
    }

    fn resolve_postbase(&self, base_index: u64, postbase: u64) -> Result<(&str, &str), Http3Error> {
        let failed = Http3Error::stream(
            ErrorCode::QpackDecompressionFailed,
            "dynamic table reference out of range",
        );
        self.dynamic_table
            .lookup_index(base_index + postbase + 1)
            .ok_or(failed)
    }

    fn decode_indexed(
        &self,
        buf: &[u8],
        base_index: u64,
    ) -> Result<(HeaderField, usize), Http3Error> {
        let failed = Http3Error::stream(ErrorCode::QpackDecompressionFailed, "bad indexed field");
        let is_static = buf[0] & 0x40 != 0;
        let (index, consumed) = prefix::decode_int(buf, 6).map_err(|_| failed)?;

        let (name, value) = if is_static {
            StaticTable::lookup_index(index).ok_or(failed)?
        } else {
            self.resolve_relative(base_index, index)?
        };

        Ok((HeaderField::new(name, value), consumed))
    }

    fn decode_indexed_postbase(
        &self,
        buf: &[u8],
        base_index: u64,
    ) -> Result<(HeaderField, usize), Http3Error> {
        let failed =
            Http3Error::stream(ErrorCode::QpackDecompressionFailed, "bad postbase field");
        let (index, consumed) = prefix::decode_int(buf, 4).map_err(|_| failed)?;
        let (name, value) = self.resolve_postbase(base_index, index)?;
        Ok((HeaderField::new(name, value), consumed))
    }

    fn decode_literal_with_name_ref(
        &self,
        buf: &[u8],
        base_index: u64,
    ) -> Result<(HeaderField, usize), Http3Error> {
        let failed = Http3Error::stream(
            ErrorCode::QpackDecompressionFailed,
            "bad literal with name reference",
        );
        let never_index = buf[0] & 0x20 != 0;
        let is_static = buf[0] & 0x10 != 0;

        let (index, mut consumed) = prefix::decode_int(buf, 4).map_err(|_| failed)?;
        let name = if is_static {
            StaticTable::lookup_index(index).ok_or(failed)?.0
        } else {
            self.resolve_relative(base_index, index)?.0
        };

        let (value, n) = prefix::decode_string(&buf[consumed..], 7).map_err(|_| failed)?;
        consumed += n;
        let value = String::from_utf8(value).map_err(|_| failed)?;

        let mut field = HeaderField::new(name, value);
        field.never_index = never_index;
        Ok((field, consumed))
    }

    fn decode_literal(buf: &[u8]) -> Result<(HeaderField, usize), Http3Error> {
        let failed = Http3Error::stream(ErrorCode::QpackDecompressionFailed, "bad literal field");
        let never_index = buf[0] & 0x10 != 0;

        let (name, mut consumed) = prefix::decode_string(buf, 3).map_err(|_| failed)?;
        let (value, n) = prefix::decode_string(&buf[consumed..], 7).map_err(|_| failed)?;
        consumed += n;

        let name = String::from_utf8(name).map_err(|_| failed)?;
        let value = String::from_utf8(value).map_err(|_| failed)?;

        let mut field = HeaderField::new(name, value);
        field.never_index = never_index;
        Ok((field, consumed))
    }

    fn decode_literal_with_postbase_name_ref(
        &self,
        buf: &[u8],
        base_index: u64,
    ) -> Result<(HeaderField, usize), Http3Error> {
        let failed = Http3Error::stream(
            ErrorCode::QpackDecompressionFailed,
            "bad literal with postbase name reference",
        );
        let never_index = buf[0] & 0x08 != 0;

        let (index, mut consumed) = prefix::decode_int(buf, 3).map_err(|_| failed)?;
        let name = self.resolve_postbase(base_index, index)?.0.to_string();

        let (value, n) = prefix::decode_string(&buf[consumed..], 7).map_err(|_| failed)?;
        consumed += n;
        let value = String::from_utf8(value).map_err(|_| failed)?;

        let mut field = HeaderField::new(name, value);
        field.never_index = never_index;
        Ok((field, consumed))
    }

    //
    // Encoder stream, receiving side (decoder role)
    //

    /// Feeds bytes received on the peer's encoder stream. Whole instructions
    /// are applied immediately; a trailing partial instruction is buffered.
    /// A malformed instruction fails every pending blocked decode and marks
    /// the instance invalid.
    pub fn on_encoder_stream_recv(&mut self, data: &[u8]) -> Result<(), Http3Error> {
        self.encoder_stream_inbound.write(data);

        let mut inserts = 0u64;
        loop {
            let buf = self.encoder_stream_inbound.to_bytes();
            if buf.is_empty() {
                break;
            }

            let result = self.apply_encoder_instruction(&buf);
            match result {
                Ok(Some((consumed, was_insert))) => {
                    self.encoder_stream_inbound.consume(consumed);
                    inserts += was_insert as u64;
                }
                Ok(None) => break, // incomplete
                Err(err) => {
                    self.abort_decode();
                    return Err(err);
                }
            }
        }

        if inserts > 0 {
            self.write_table_state_synchronize(inserts);
            self.resume_decode();
        }

        Ok(())
    }

    /// Applies one instruction, returning how many bytes it consumed and
    /// whether it inserted an entry, or `None` if the buffer doesn't hold a
    /// whole instruction yet.
    fn apply_encoder_instruction(&mut self, buf: &Bytes) -> Result<Option<(usize, bool)>, Http3Error> {
        let stream_error = Http3Error::connection(
            ErrorCode::QpackEncoderStreamError,
            "malformed encoder stream instruction",
        );

        let map_err = |e: PrefixError| match e {
            PrefixError::UnexpectedEnd => None,
            _ => Some(stream_error),
        };

        macro_rules! try_parse {
            ($expr:expr) => {
                match $expr {
                    Ok(v) => v,
                    Err(e) => {
                        return match map_err(e) {
                            None => Ok(None),
                            Some(err) => Err(err),
                        }
                    }
                }
            };
        }

        let first = buf[0];
        if first & 0x80 != 0 {
            // Insert With Name Reference
            let is_static = first & 0x40 != 0;
            let (index, mut consumed) = try_parse!(prefix::decode_int(buf, 6));
            let (value, n) = try_parse!(prefix::decode_string(&buf[consumed..], 7));
            consumed += n;

            let value = String::from_utf8(value).map_err(|_| stream_error)?;
            trace!(
                target: "qpack",
                "received insert with name ref: is_static={}, index={}, value={}",
                is_static,
                index,
                value
            );
            let result = self
                .dynamic_table
                .insert_with_name_ref(is_static, index, &value);
            if result.match_type == MatchType::None {
                return Err(stream_error);
            }
            Ok(Some((consumed, true)))
        } else if first & 0x40 != 0 {
            // Insert Without Name Reference
            let (name, mut consumed) = try_parse!(prefix::decode_string(buf, 5));
            let (value, n) = try_parse!(prefix::decode_string(&buf[consumed..], 7));
            consumed += n;

            let name = String::from_utf8(name).map_err(|_| stream_error)?;
            let value = String::from_utf8(value).map_err(|_| stream_error)?;
            trace!(
                target: "qpack",
                "received insert without name ref: name={}, value={}",
                name,
                value
            );
            if self.dynamic_table.insert(&name, &value).match_type == MatchType::None {
                return Err(stream_error);
            }
            Ok(Some((consumed, true)))
        } else if first & 0x20 != 0 {
            // Dynamic Table Size Update
            let (max_size, consumed) = try_parse!(prefix::decode_int(buf, 5));
            trace!(target: "qpack", "received dynamic table size update: max_size={}", max_size);
            self.dynamic_table.update_size(max_size as usize);
            Ok(Some((consumed, false)))
        } else {
            // Duplicate
            let (index, consumed) = try_parse!(prefix::decode_int(buf, 5));
            trace!(target: "qpack", "received duplicate: index={}", index);
            if self.dynamic_table.duplicate(index).match_type == MatchType::None {
                return Err(stream_error);
            }
            Ok(Some((consumed, true)))
        }
    }

    /// Re-checks the blocked list after table growth; each request whose
    /// largest reference is now covered is decoded exactly once.
    fn resume_decode(&mut self) {
        let inserted = self.dynamic_table.inserted_count();
        let mut ready = Vec::new();
        let mut index = 0;
        while index < self.blocked_list.len() {
            if self.blocked_list[index].largest_reference <= inserted {
                ready.push(self.blocked_list.remove(index).expect("index in range"));
            } else {
                index += 1;
            }
        }

        for request in ready {
            self.decode_now(request.stream_id, &request.header_block);
        }
    }

    /// Fails every pending decode and poisons the instance.
    fn abort_decode(&mut self) {
        self.invalid = true;
        while let Some(request) = self.blocked_list.pop_front() {
            self.events.push_back(QpackEvent::DecodeFailed {
                stream_id: request.stream_id,
            });
        }
    }

    //
    // Decoder stream, receiving side (encoder role)
    //

    /// Feeds bytes received on the peer's decoder stream.
    pub fn on_decoder_stream_recv(&mut self, data: &[u8]) -> Result<(), Http3Error> {
        let stream_error = Http3Error::connection(
            ErrorCode::QpackDecoderStreamError,
            "malformed decoder stream instruction",
        );

        self.decoder_stream_inbound.write(data);

        loop {
            let buf = self.decoder_stream_inbound.to_bytes();
            if buf.is_empty() {
                break;
            }

            let first = buf[0];
            let parsed = if first & 0x80 != 0 {
                prefix::decode_int(&buf, 7)
            } else {
                prefix::decode_int(&buf, 6)
            };

            let (operand, consumed) = match parsed {
                Ok(v) => v,
                Err(PrefixError::UnexpectedEnd) => break,
                Err(_) => return Err(stream_error),
            };

            if first & 0x80 != 0 {
                // Header Acknowledgement
                trace!(target: "qpack", "received header acknowledgement: stream_id={}", operand);
                self.update_largest_known_received_index_by_stream_id(operand);
                self.release_references(operand);
            } else if first & 0x40 != 0 {
                // Stream Cancellation
                trace!(target: "qpack", "received stream cancellation: stream_id={}", operand);
                self.release_references(operand);
            } else {
                // Table State Synchronize
                trace!(target: "qpack", "received table state synchronize: insert_count={}", operand);
                self.largest_known_received_index += operand;
            }

            self.decoder_stream_inbound.consume(consumed);
        }

        Ok(())
    }

    fn update_largest_known_received_index_by_stream_id(&mut self, stream_id: u64) {
        if let Some(reference) = self.references.get(&stream_id) {
            if reference.largest > self.largest_known_received_index {
                self.largest_known_received_index = reference.largest;
            }
        }
    }

    fn release_references(&mut self, stream_id: u64) {
        if let Some(reference) = self.references.remove(&stream_id) {
            trace!(
                target: "qpack",
                "release references: stream_id={}, smallest={}, largest={}",
                stream_id,
                reference.smallest,
                reference.largest
            );
            for index in reference.referred {
                self.dynamic_table.unref_entry(index);
            }
        }
    }

    //
    // Outbound instructions
    //

    fn write_insert_with_name_ref(&mut self, index: u64, dynamic: bool, value: &str) {
        let mut out = Vec::with_capacity(value.len() + 8);
        prefix::encode_int(&mut out, 6, 0b10 | !dynamic as u8, index);
        prefix::encode_string(&mut out, 7, 0, value.as_bytes());
        self.encoder_instructions.write(&out);
        trace!(
            target: "qpack",
            "wrote insert with name ref: index={}, dynamic={}, value={}",
            index,
            dynamic,
            value
        );
    }

    fn write_insert_without_name_ref(&mut self, name: &str, value: &str) {
        let mut out = Vec::with_capacity(name.len() + value.len() + 8);
        prefix::encode_string(&mut out, 5, 0b01, name.as_bytes());
        prefix::encode_string(&mut out, 7, 0, value.as_bytes());
        self.encoder_instructions.write(&out);
        trace!(target: "qpack", "wrote insert without name ref: name={}, value={}", name, value);
    }

    fn write_duplicate(&mut self, index: u64) {
        let mut out = Vec::with_capacity(8);
        prefix::encode_int(&mut out, 5, 0b000, index);
        self.encoder_instructions.write(&out);
        trace!(target: "qpack", "wrote duplicate: index={}", index);
    }

    fn write_dynamic_table_size_update(&mut self, max_size: u64) {
        let mut out = Vec::with_capacity(8);
        prefix::encode_int(&mut out, 5, 0b001, max_size);
        self.encoder_instructions.write(&out);
        trace!(target: "qpack", "wrote dynamic table size update: max_size={}", max_size);
    }

    fn write_header_acknowledgement(&mut self, stream_id: u64) {
        let mut out = Vec::with_capacity(8);
        prefix::encode_int(&mut out, 7, 0b1, stream_id);
        self.decoder_instructions.write(&out);
        trace!(target: "qpack", "wrote header acknowledgement: stream_id={}", stream_id);
    }

    fn write_stream_cancellation(&mut self, stream_id: u64) {
        let mut out = Vec::with_capacity(8);
        prefix::encode_int(&mut out, 6, 0b01, stream_id);
        self.decoder_instructions.write(&out);
        trace!(target: "qpack", "wrote stream cancellation: stream_id={}", stream_id);
    }

    fn write_table_state_synchronize(&mut self, insert_count: u64) {
        let mut out = Vec::with_capacity(8);
        prefix::encode_int(&mut out, 6, 0b00, insert_count);
        self.decoder_instructions.write(&out);
        trace!(target: "qpack", "wrote table state synchronize: insert_count={}", insert_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_section() -> FieldSection {
        let mut section = FieldSection::new();
        section.push(HeaderField::new(":method", "GET"));
        section.push(HeaderField::new(":scheme", "https"));
        section.push(HeaderField::new(":path", "/"));
        section.push(HeaderField::new(":authority", "example.com"));
        section.push(HeaderField::new("x-request-id", "abc123"));
        section
    }

    /// Moves encoder-stream and header-block bytes from `local` to `remote`
    /// and decoder-stream feedback back again.
    fn sync_streams(local: &mut Qpack, remote: &mut Qpack) {
        let enc = local.drain_encoder_instructions().to_bytes();
        if !enc.is_empty() {
            remote.on_encoder_stream_recv(&enc).unwrap();
        }
        let dec = remote.drain_decoder_instructions().to_bytes();
        if !dec.is_empty() {
            local.on_decoder_stream_recv(&dec).unwrap();
        }
    }

    #[test]
    fn roundtrip_through_dynamic_table() {
        let mut local = Qpack::new(1 << 14, 4096, 10);
        let mut remote = Qpack::new(1 << 14, 4096, 10);

        let section = request_section();
        let mut block = Vec::new();
        local.encode(0, &section, &mut block).unwrap();

        // Custom headers went into the local dynamic table.
        assert!(local.inserted_count() > 0);

        let enc = local.drain_encoder_instructions().to_bytes();
        remote.on_encoder_stream_recv(&enc).unwrap();

        let status = remote.decode(0, Bytes::from(block)).unwrap();
        assert_eq!(status, DecodeStatus::Done);

        match remote.poll_event().unwrap() {
            QpackEvent::DecodeComplete { stream_id, section: decoded } => {
                assert_eq!(stream_id, 0);
                assert_eq!(decoded, section);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Feedback releases the references and advances the received index.
        let dec = remote.drain_decoder_instructions().to_bytes();
        assert!(!dec.is_empty());
        local.on_decoder_stream_recv(&dec).unwrap();
        assert_eq!(
            local.largest_known_received_index(),
            local.inserted_count()
        );
    }

    #[test]
    fn second_encode_uses_acked_entries() {
        let mut local = Qpack::new(1 << 14, 4096, 10);
        let mut remote = Qpack::new(1 << 14, 4096, 10);

        let section = request_section();

        let mut first = Vec::new();
        local.encode(0, &section, &mut first).unwrap();
        remote.on_encoder_stream_recv(&local.drain_encoder_instructions().to_bytes()).unwrap();
        remote.decode(0, Bytes::from(first.clone())).unwrap();
        remote.poll_event().unwrap();
        local
            .on_decoder_stream_recv(&remote.drain_decoder_instructions().to_bytes())
            .unwrap();

        // Re-encoding the same section emits no new table inserts; the block
        // is nothing but index references.
        let inserted = local.inserted_count();
        let mut second = Vec::new();
        local.encode(4, &section, &mut second).unwrap();
        assert_eq!(local.inserted_count(), inserted);
        assert!(local.drain_encoder_instructions().is_empty());
        assert!(second.len() <= first.len());

        let status = remote.decode(4, Bytes::from(second)).unwrap();
        assert_eq!(status, DecodeStatus::Done);
        match remote.poll_event().unwrap() {
            QpackEvent::DecodeComplete { section: decoded, .. } => assert_eq!(decoded, section),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn blocked_decode_resumes_once() {
        let mut local = Qpack::new(1 << 14, 4096, 10);
        let mut remote = Qpack::new(1 << 14, 4096, 10);

        let section = request_section();
        let mut block = Vec::new();
        local.encode(0, &section, &mut block).unwrap();
        let instructions = local.drain_encoder_instructions().to_bytes();

        // Header block beats the encoder stream: the decode parks.
        let status = remote.decode(0, Bytes::from(block)).unwrap();
        assert_eq!(status, DecodeStatus::Blocked);
        assert!(remote.poll_event().is_none());

        // The instructions arrive; the decode resumes exactly once.
        remote.on_encoder_stream_recv(&instructions).unwrap();
        match remote.poll_event().unwrap() {
            QpackEvent::DecodeComplete { section: decoded, .. } => assert_eq!(decoded, section),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(remote.poll_event().is_none());

        // Later encoder-stream traffic doesn't resurrect it.
        let mut more = Qpack::new(1 << 14, 4096, 10);
        let mut block2 = Vec::new();
        let mut extra = FieldSection::new();
        extra.push(HeaderField::new("x-more", "yes"));
        more.encode(8, &extra, &mut block2).unwrap();
        remote
            .on_encoder_stream_recv(&more.drain_encoder_instructions().to_bytes())
            .unwrap();
        assert!(remote.poll_event().is_none());
    }

    #[test]
    fn blocked_queue_capacity() {
        let mut remote = Qpack::new(1 << 14, 4096, 1);

        // Prefix demanding inserts we don't have: largest_ref 5, delta 5.
        let mut block = Vec::new();
        prefix::encode_int(&mut block, 8, 0, 5);
        prefix::encode_int(&mut block, 7, 0, 0);

        assert_eq!(
            remote.decode(0, Bytes::from(block.clone())).unwrap(),
            DecodeStatus::Blocked
        );
        let err = remote.decode(4, Bytes::from(block)).unwrap_err();
        assert_eq!(err.code, ErrorCode::QpackDecompressionFailed);
        assert_eq!(err.reason, "too many blocked streams");
    }

    #[test]
    fn malformed_encoder_stream_aborts_blocked_decodes() {
        let mut remote = Qpack::new(1 << 14, 64, 10);

        let mut block = Vec::new();
        prefix::encode_int(&mut block, 8, 0, 3);
        prefix::encode_int(&mut block, 7, 0, 0);
        assert_eq!(
            remote.decode(0, Bytes::from(block)).unwrap(),
            DecodeStatus::Blocked
        );

        // Insert With Name Reference pointing at a bogus static index.
        let mut bad = Vec::new();
        prefix::encode_int(&mut bad, 6, 0b11, 2000);
        prefix::encode_string(&mut bad, 7, 0, b"v");
        let err = remote.on_encoder_stream_recv(&bad).unwrap_err();
        assert_eq!(err.code, ErrorCode::QpackEncoderStreamError);
        assert!(err.is_connection_fatal());

        assert_eq!(
            remote.poll_event(),
            Some(QpackEvent::DecodeFailed { stream_id: 0 })
        );

        // The instance stays poisoned.
        let mut block = Vec::new();
        prefix::encode_int(&mut block, 8, 0, 0);
        prefix::encode_int(&mut block, 7, 0, 0);
        assert!(remote.decode(4, Bytes::from(block)).is_err());
    }

    #[test]
    fn partial_instructions_buffer() {
        let mut local = Qpack::new(1 << 14, 4096, 10);
        let mut remote = Qpack::new(1 << 14, 4096, 10);

        let mut section = FieldSection::new();
        section.push(HeaderField::new("x-split", "across-reads"));
        let mut block = Vec::new();
        local.encode(0, &section, &mut block).unwrap();
        let instructions = local.drain_encoder_instructions().to_bytes();
        assert!(instructions.len() > 3);

        // Deliver the encoder stream one byte at a time.
        for chunk in instructions.chunks(1) {
            remote.on_encoder_stream_recv(chunk).unwrap();
        }
        assert_eq!(remote.inserted_count(), local.inserted_count());

        assert_eq!(
            remote.decode(0, Bytes::from(block)).unwrap(),
            DecodeStatus::Done
        );
        match remote.poll_event().unwrap() {
            QpackEvent::DecodeComplete { section: decoded, .. } => assert_eq!(decoded, section),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn field_section_size_limit() {
        let mut local = Qpack::new(1 << 14, 0, 10);
        let mut remote = Qpack::new(16, 0, 10);

        let mut section = FieldSection::new();
        section.push(HeaderField::new("x-large", "this value is longer than sixteen bytes"));
        let mut block = Vec::new();
        local.encode(0, &section, &mut block).unwrap();

        assert_eq!(
            remote.decode(0, Bytes::from(block)).unwrap(),
            DecodeStatus::Done
        );
        assert_eq!(
            remote.poll_event(),
            Some(QpackEvent::DecodeFailed { stream_id: 0 })
        );
        // No acknowledgement for a failed block, and no table state to sync.
        assert!(remote.drain_decoder_instructions().is_empty());
    }

    #[test]
    fn never_index_fields_stay_out_of_the_table() {
        let mut local = Qpack::new(1 << 14, 4096, 10);
        let mut remote = Qpack::new(1 << 14, 4096, 10);

        let mut section = FieldSection::new();
        section.push(HeaderField::never_index("authorization", "Bearer secret"));
        let mut block = Vec::new();
        local.encode(0, &section, &mut block).unwrap();

        sync_streams(&mut local, &mut remote);
        assert_eq!(remote.decode(0, Bytes::from(block)).unwrap(), DecodeStatus::Done);
        match remote.poll_event().unwrap() {
            QpackEvent::DecodeComplete { section: decoded, .. } => {
                let field = decoded.iter().next().unwrap();
                assert!(field.never_index);
                assert_eq!(field.value, "Bearer secret");
                // The value never entered either dynamic table.
                assert_eq!(local.inserted_count(), 0);
                assert_eq!(remote.inserted_count(), 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn cancel_releases_peer_references() {
        let mut local = Qpack::new(1 << 14, 4096, 10);
        let mut remote = Qpack::new(1 << 14, 4096, 10);

        let mut section = FieldSection::new();
        section.push(HeaderField::new("x-pending", "1"));
        let mut block = Vec::new();
        local.encode(0, &section, &mut block).unwrap();
        assert!(local.references.contains_key(&0));

        // The remote decoder cancels the stream instead of decoding.
        remote.cancel(0);
        let dec = remote.drain_decoder_instructions().to_bytes();
        local.on_decoder_stream_recv(&dec).unwrap();
        assert!(!local.references.contains_key(&0));
    }
}
