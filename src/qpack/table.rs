use std::collections::VecDeque;

use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    None,
    Name,
    Exact,
}

#[derive(Debug, Clone, Copy)]
pub struct LookupResult {
    pub index: u64,
    pub match_type: MatchType,
}

impl LookupResult {
    pub const NONE: LookupResult = LookupResult {
        index: 0,
        match_type: MatchType::None,
    };
}

// qpack-05 Appendix A.
#[rustfmt::skip]
pub const STATIC_HEADER_FIELDS: [(&str, &str); 99] = [
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    ("strict-transport-security", "max-age=31536000; includesubdomains"),
    ("strict-transport-security", "max-age=31536000; includesubdomains; preload"),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    ("content-security-policy", "script-src 'none'; object-src 'none'; base-uri 'none'"),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

pub struct StaticTable;

impl StaticTable {
    pub fn lookup_index(index: u64) -> Option<(&'static str, &'static str)> {
        STATIC_HEADER_FIELDS.get(index as usize).copied()
    }

    pub fn lookup(name: &str, value: &str) -> LookupResult {
        let mut result = LookupResult::NONE;
        for (i, (n, v)) in STATIC_HEADER_FIELDS.iter().enumerate() {
            if *n != name {
                continue;
            }
            if *v == value {
                return LookupResult {
                    index: i as u64,
                    match_type: MatchType::Exact,
                };
            }
            if result.match_type == MatchType::None {
                result = LookupResult {
                    index: i as u64,
                    match_type: MatchType::Name,
                };
            }
        }
        result
    }
}

/// Backing store for dynamic table entries: a circular byte arena of
/// 2×max_table_size. An entry never wraps; when a write would run off the
/// end it restarts at offset zero, and the doubled capacity guarantees the
/// bytes still live until the entry is evicted.
struct DynamicTableStorage {
    data: Vec<u8>,
    head: usize,
    tail: usize,
}

impl DynamicTableStorage {
    fn new(max_size: usize) -> Self {
        Self {
            data: vec![0; max_size * 2],
            head: 0,
            tail: 0,
        }
    }

    fn write(&mut self, name: &str, value: &str) -> usize {
        let len = name.len() + value.len();
        if self.head + len > self.data.len() {
            self.head = 0;
        }
        let offset = self.head;
        self.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        self.data[offset + name.len()..offset + len].copy_from_slice(value.as_bytes());
        self.head += len;
        offset
    }

    fn read(&self, offset: usize, name_len: usize, value_len: usize) -> (&str, &str) {
        let name = &self.data[offset..offset + name_len];
        let value = &self.data[offset + name_len..offset + name_len + value_len];
        // Only strings written by `write` are ever read back.
        (
            std::str::from_utf8(name).unwrap_or(""),
            std::str::from_utf8(value).unwrap_or(""),
        )
    }

    fn erase(&mut self, offset: usize, name_len: usize, value_len: usize) {
        self.tail = offset + name_len + value_len;
    }
}

#[derive(Debug, Clone, Copy)]
struct DynamicTableEntry {
    index: u64,
    offset: usize,
    name_len: usize,
    value_len: usize,
    ref_count: usize,
}

impl DynamicTableEntry {
    fn size(&self) -> usize {
        self.name_len + self.value_len
    }
}

/// The QPACK dynamic table: an ordered ring of entries with absolute,
/// monotonically increasing indices (first insert is index 1). The sum of
/// entry sizes never exceeds `max_size`; eviction scans from the oldest
/// entry and an entry with outstanding references blocks it, failing the
/// insert instead.
pub struct DynamicTable {
    entries: VecDeque<DynamicTableEntry>,
    storage: DynamicTableStorage,
    available: usize,
    max_size: usize,
    inserted: u64,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        trace!(target: "qpack", "dynamic table size: {}", max_size);
        Self {
            entries: VecDeque::new(),
            storage: DynamicTableStorage::new(max_size),
            available: max_size,
            max_size,
            inserted: 0,
        }
    }

    /// Total number of inserts performed; also the absolute index of the
    /// newest entry.
    pub fn inserted_count(&self) -> u64 {
        self.inserted
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn used(&self) -> usize {
        self.max_size - self.available
    }

    fn position(&self, index: u64) -> Option<usize> {
        let front = self.entries.front()?;
        if index < front.index || index > self.inserted {
            return None;
        }
        Some((index - front.index) as usize)
    }

    pub fn lookup_index(&self, index: u64) -> Option<(&str, &str)> {
        let entry = self.entries[self.position(index)?];
        Some(self.storage.read(entry.offset, entry.name_len, entry.value_len))
    }

    /// Scans newest to oldest: an exact match wins, otherwise the newest
    /// name match is reported.
    pub fn lookup(&self, name: &str, value: &str) -> LookupResult {
        let mut result = LookupResult::NONE;
        for entry in self.entries.iter().rev() {
            if entry.name_len != name.len() {
                continue;
            }
            let (n, v) = self.storage.read(entry.offset, entry.name_len, entry.value_len);
            if n != name {
                continue;
            }
            if v == value {
                return LookupResult {
                    index: entry.index,
                    match_type: MatchType::Exact,
                };
            }
            if result.match_type == MatchType::None {
                result = LookupResult {
                    index: entry.index,
                    match_type: MatchType::Name,
                };
            }
        }
        result
    }

    /// Inserts (name, value), evicting unreferenced old entries as needed.
    /// Fails with `MatchType::None` — leaving the table unchanged — if the
    /// space can't be freed without evicting a referenced entry.
    pub fn insert(&mut self, name: &str, value: &str) -> LookupResult {
        if self.max_size == 0 {
            return LookupResult::NONE;
        }

        let required = name.len() + value.len();
        if required > self.max_size {
            return LookupResult::NONE;
        }

        // Check eviction feasibility without touching anything.
        let mut available = self.available;
        let mut evictable = 0;
        for entry in &self.entries {
            if available >= required {
                break;
            }
            if entry.ref_count > 0 {
                return LookupResult::NONE;
            }
            available += entry.size();
            evictable += 1;
        }
        if available < required {
            return LookupResult::NONE;
        }

        for _ in 0..evictable {
            let evicted = self.entries.pop_front().expect("counted above");
            trace!(target: "qpack", "evict entry: index={}", evicted.index);
            self.available += evicted.size();
            self.storage
                .erase(evicted.offset, evicted.name_len, evicted.value_len);
        }

        let offset = self.storage.write(name, value);
        self.inserted += 1;
        self.entries.push_back(DynamicTableEntry {
            index: self.inserted,
            offset,
            name_len: name.len(),
            value_len: value.len(),
            ref_count: 0,
        });
        self.available -= required;

        trace!(
            target: "qpack",
            "insert entry: index={}, size={}, available={}",
            self.inserted,
            required,
            self.available
        );

        LookupResult {
            index: self.inserted,
            match_type: if value.is_empty() {
                MatchType::Name
            } else {
                MatchType::Exact
            },
        }
    }

    /// Inserts an entry whose name is referenced from the static table or
    /// this table by absolute index.
    pub fn insert_with_name_ref(
        &mut self,
        is_static: bool,
        name_index: u64,
        value: &str,
    ) -> LookupResult {
        let name = if is_static {
            match StaticTable::lookup_index(name_index) {
                Some((name, _)) => name.to_string(),
                None => return LookupResult::NONE,
            }
        } else {
            match self.lookup_index(name_index) {
                Some((name, _)) => name.to_string(),
                None => return LookupResult::NONE,
            }
        };
        self.insert(&name, value)
    }

    pub fn duplicate(&mut self, index: u64) -> LookupResult {
        let Some((name, value)) = self.lookup_index(index) else {
            return LookupResult::NONE;
        };
        let (name, value) = (name.to_string(), value.to_string());
        self.insert(&name, &value)
    }

    /// Whether referring to `index` should be preceded by duplicating it.
    /// Duplicating is safe but never required.
    pub fn should_duplicate(&self, _index: u64) -> bool {
        false
    }

    /// Applies a Dynamic Table Size Update. Shrinking evicts unreferenced
    /// entries from the oldest end; growth is capped by the arena that was
    /// allocated up front.
    pub fn update_size(&mut self, max_size: usize) {
        let max_size = max_size.min(self.storage.data.len() / 2);
        while self.used() > max_size {
            match self.entries.front() {
                Some(entry) if entry.ref_count == 0 => {
                    let evicted = self.entries.pop_front().expect("front exists");
                    self.available += evicted.size();
                    self.storage
                        .erase(evicted.offset, evicted.name_len, evicted.value_len);
                }
                _ => break,
            }
        }
        let used = self.used();
        self.max_size = max_size.max(used);
        self.available = self.max_size - used;
    }

    pub fn ref_entry(&mut self, index: u64) {
        if let Some(pos) = self.position(index) {
            self.entries[pos].ref_count += 1;
        }
    }

    pub fn unref_entry(&mut self, index: u64) {
        if let Some(pos) = self.position(index) {
            self.entries[pos].ref_count = self.entries[pos].ref_count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_lookup() {
        assert_eq!(StaticTable::lookup_index(17), Some((":method", "GET")));
        assert_eq!(StaticTable::lookup_index(25), Some((":status", "200")));
        assert_eq!(StaticTable::lookup_index(99), None);

        let exact = StaticTable::lookup(":method", "GET");
        assert_eq!(exact.match_type, MatchType::Exact);
        assert_eq!(exact.index, 17);

        let name = StaticTable::lookup(":method", "PATCH");
        assert_eq!(name.match_type, MatchType::Name);
        assert_eq!(name.index, 15);

        assert_eq!(StaticTable::lookup("x-custom", "1").match_type, MatchType::None);
    }

    #[test]
    fn insert_and_lookup() {
        let mut table = DynamicTable::new(100);

        let result = table.insert("x-custom", "one");
        assert_eq!(result.match_type, MatchType::Exact);
        assert_eq!(result.index, 1);
        assert_eq!(table.inserted_count(), 1);

        assert_eq!(table.lookup_index(1), Some(("x-custom", "one")));

        let exact = table.lookup("x-custom", "one");
        assert_eq!(exact.match_type, MatchType::Exact);
        let name = table.lookup("x-custom", "two");
        assert_eq!(name.match_type, MatchType::Name);
        assert_eq!(name.index, 1);
    }

    #[test]
    fn size_bound_holds_under_eviction() {
        let mut table = DynamicTable::new(32);
        for i in 0..100 {
            let value = format!("value-{i}");
            table.insert("name", &value);
            assert!(table.used() <= 32);
        }
        // Old entries fell out; the absolute index kept rising.
        assert_eq!(table.inserted_count(), 100);
        assert_eq!(table.lookup_index(1), None);
        assert_eq!(table.lookup_index(100), Some(("name", "value-99")));
    }

    #[test]
    fn referenced_entry_blocks_eviction() {
        let mut table = DynamicTable::new(20);
        table.insert("aaaa", "bbbb"); // 8 bytes, index 1
        table.insert("cccc", "dddd"); // 8 bytes, index 2
        table.ref_entry(1);

        // Would need to evict index 1, which is referenced.
        let before_used = table.used();
        let result = table.insert("eeeeeeee", "ffffffff");
        assert_eq!(result.match_type, MatchType::None);
        assert_eq!(table.used(), before_used);
        assert_eq!(table.lookup_index(1), Some(("aaaa", "bbbb")));

        // Dropping the reference unblocks it.
        table.unref_entry(1);
        let result = table.insert("eeeeeeee", "ffffffff");
        assert_eq!(result.match_type, MatchType::Exact);
        assert_eq!(table.lookup_index(1), None);
        assert!(table.used() <= 20);
    }

    #[test]
    fn oversized_entry_rejected() {
        let mut table = DynamicTable::new(8);
        assert_eq!(
            table.insert("very-long-name", "very-long-value").match_type,
            MatchType::None
        );
        assert_eq!(table.inserted_count(), 0);
    }

    #[test]
    fn duplicate_makes_fresh_index() {
        let mut table = DynamicTable::new(100);
        table.insert("x", "1");
        let result = table.duplicate(1);
        assert_eq!(result.index, 2);
        assert_eq!(table.lookup_index(2), Some(("x", "1")));
    }

    #[test]
    fn insert_with_static_name_ref() {
        let mut table = DynamicTable::new(100);
        let result = table.insert_with_name_ref(true, 17, "PATCH");
        assert_eq!(result.match_type, MatchType::Exact);
        assert_eq!(table.lookup_index(1), Some((":method", "PATCH")));
    }

    #[test]
    fn update_size_evicts() {
        let mut table = DynamicTable::new(32);
        table.insert("aaaa", "bbbb");
        table.insert("cccc", "dddd");
        assert_eq!(table.used(), 16);

        table.update_size(8);
        assert_eq!(table.max_size(), 8);
        assert!(table.used() <= 8);
        assert_eq!(table.lookup_index(1), None);
        assert_eq!(table.lookup_index(2), Some(("cccc", "dddd")));
    }

    #[test]
    fn storage_wraps_without_corruption() {
        // Arena is 2×max_size; hammering inserts exercises the wrap.
        let mut table = DynamicTable::new(24);
        for i in 0..50 {
            let value = format!("v{:02}", i);
            table.insert("key", &value);
            let newest = table.inserted_count();
            assert_eq!(table.lookup_index(newest), Some(("key", value.as_str())));
        }
    }
}
