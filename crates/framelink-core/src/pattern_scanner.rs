//! Signature scanning over the live address space
//!
//! Patterns are matched with a Boyer-Moore-Horspool variant that tolerates
//! wildcards: only exact mask positions feed the bad-byte table, and every
//! wildcard caps the largest shift so no candidate alignment is skipped.
//!
//! Region lists are captured once per [`ScanSession`]. Modules load and
//! unload, so a session is meant to be short-lived.

use crate::memory;
use crate::pe;
use framelink_common::{Error, MemoryRegion, Result, SignaturePattern};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Longest pattern accepted
const MAX_PATTERN_LENGTH: usize = 4096;

/// A pattern prepared for repeated searching
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    bytes: Vec<u8>,
    mask: Vec<bool>,
    skip: [usize; 256],
}

impl CompiledPattern {
    /// Prepare `bytes` with a parallel mask (`true` = exact).
    ///
    /// Returns `None` for an empty pattern, a length mismatch, or an
    /// oversize pattern.
    pub fn new(bytes: &[u8], mask: &[bool]) -> Option<Self> {
        let len = bytes.len();
        if len == 0 || len != mask.len() || len > MAX_PATTERN_LENGTH {
            return None;
        }

        // Any wildcard before the last position can align with any byte,
        // so no shift may jump past it.
        let default_shift = mask[..len - 1]
            .iter()
            .rposition(|&exact| !exact)
            .map(|i| len - 1 - i)
            .unwrap_or(len);

        let mut skip = [default_shift; 256];
        for i in 0..len - 1 {
            if mask[i] {
                skip[bytes[i] as usize] = (len - 1 - i).min(default_shift);
            }
        }

        Some(Self {
            bytes: bytes.to_vec(),
            mask: mask.to_vec(),
            skip,
        })
    }

    /// Prepare from a `'x'`/`'?'` mask string
    pub fn from_mask_str(bytes: &[u8], mask: &str) -> Option<Self> {
        let bits: Vec<bool> = mask.chars().map(|c| c == 'x').collect();
        Self::new(bytes, &bits)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Shift applied when `byte` sits under the last pattern position
    pub fn shift_for(&self, byte: u8) -> usize {
        self.skip[byte as usize]
    }

    fn matches_at(&self, window: &[u8]) -> bool {
        // Compare back to front; the tail usually rejects first.
        (0..self.bytes.len())
            .rev()
            .all(|j| !self.mask[j] || window[j] == self.bytes[j])
    }
}

/// Find every offset in `data` where `pattern` matches, ascending.
///
/// `max_results == 0` means unlimited.
pub fn find_in_buffer(data: &[u8], pattern: &CompiledPattern, max_results: usize) -> Vec<usize> {
    let len = pattern.len();
    let mut results = Vec::new();
    if len == 0 || data.len() < len {
        return results;
    }

    let mut pos = 0;
    while pos + len <= data.len() {
        let window = &data[pos..pos + len];
        if pattern.matches_at(window) {
            results.push(pos);
            if max_results > 0 && results.len() >= max_results {
                break;
            }
        }
        pos += pattern.shift_for(window[len - 1]);
    }

    results
}

/// Search `data` for a raw pattern and mask string.
///
/// Empty or mismatched input yields no matches rather than an error.
pub fn search_buffer(data: &[u8], bytes: &[u8], mask: &str) -> Vec<usize> {
    match CompiledPattern::from_mask_str(bytes, mask) {
        Some(compiled) => find_in_buffer(data, &compiled, 0),
        None => Vec::new(),
    }
}

/// Split IDA-style text (`"48 8B ?? 24"`) into bytes and an `x`/`?` mask
pub fn parse_pattern(text: &str) -> Option<(Vec<u8>, String)> {
    let parsed = SignaturePattern::from_ida("", text)?;
    Some((parsed.bytes.into_owned(), parsed.mask.into_owned()))
}

/// Counters for one search
#[derive(Debug, Clone, Default)]
pub struct ScanStats {
    pub regions_scanned: usize,
    pub bytes_scanned: u64,
    pub matches_found: usize,
    pub duration_ms: u64,
}

/// One snapshot of the readable address space
pub struct ScanSession {
    regions: Vec<MemoryRegion>,
    include_execute_only: bool,
    max_results: usize,
    last_stats: ScanStats,
}

impl ScanSession {
    /// Walk the address space now and keep the result for this session
    pub fn capture() -> Result<Self> {
        let regions = memory::enumerate_regions()?;
        Ok(Self {
            regions,
            include_execute_only: true,
            max_results: 0,
            last_stats: ScanStats::default(),
        })
    }

    /// Build a session over caller-provided regions.
    ///
    /// # Safety
    /// Every region must be mapped and readable for the session's lifetime.
    pub unsafe fn from_regions(regions: Vec<MemoryRegion>) -> Self {
        Self {
            regions,
            include_execute_only: true,
            max_results: 0,
            last_stats: ScanStats::default(),
        }
    }

    /// Skip pages that are executable but not readable
    pub fn data_only(mut self) -> Self {
        self.include_execute_only = false;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn last_stats(&self) -> &ScanStats {
        &self.last_stats
    }

    /// Addresses of every match, ascending within each region, regions in
    /// enumeration order.
    pub fn search(&mut self, bytes: &[u8], mask: &str) -> Vec<usize> {
        let Some(compiled) = CompiledPattern::from_mask_str(bytes, mask) else {
            debug!(
                target: "framelink_core::pattern_scanner",
                bytes = bytes.len(),
                mask = mask.len(),
                "Empty or mismatched pattern, nothing to search"
            );
            return Vec::new();
        };
        let regions = self.regions.clone();
        self.search_compiled(&compiled, &regions)
    }

    fn search_compiled(&mut self, pattern: &CompiledPattern, regions: &[MemoryRegion]) -> Vec<usize> {
        let start = Instant::now();
        let mut stats = ScanStats::default();
        let mut results = Vec::new();

        for region in regions {
            if !region.protection.is_scannable(self.include_execute_only) {
                continue;
            }
            if region.size < pattern.len() {
                continue;
            }

            stats.regions_scanned += 1;
            stats.bytes_scanned += region.size as u64;

            // SAFETY: regions come from the OS walk or from `from_regions`,
            // both of which describe readable memory.
            let data = unsafe { std::slice::from_raw_parts(region.base as *const u8, region.size) };

            let remaining = if self.max_results > 0 {
                self.max_results - results.len()
            } else {
                0
            };

            for offset in find_in_buffer(data, pattern, remaining) {
                trace!(
                    target: "framelink_core::pattern_scanner",
                    address = format_args!("{:#x}", region.base + offset),
                    "Pattern match"
                );
                results.push(region.base + offset);
            }

            if self.max_results > 0 && results.len() >= self.max_results {
                break;
            }
        }

        stats.matches_found = results.len();
        stats.duration_ms = start.elapsed().as_millis() as u64;
        self.last_stats = stats;
        results
    }

    /// Search for a table signature, restricted to its module image when a
    /// module hint is given.
    pub fn scan_signature(&mut self, signature: &SignaturePattern) -> Result<Vec<usize>> {
        if !signature.is_valid() {
            return Err(Error::Internal(format!(
                "Malformed signature '{}'",
                signature.name
            )));
        }
        let Some(compiled) = CompiledPattern::from_mask_str(&signature.bytes, &signature.mask)
        else {
            return Ok(Vec::new());
        };

        let regions = if signature.module.is_empty() {
            self.regions.clone()
        } else {
            let (base, size) = memory::module_range(&signature.module)?;
            memory::clip_regions(&self.regions, base, base + size)
        };

        info!(
            target: "framelink_core::pattern_scanner",
            signature = %signature.name,
            module = %signature.module,
            pattern_len = compiled.len(),
            regions = regions.len(),
            "Scanning for signature"
        );

        let matches = self.search_compiled(&compiled, &regions);

        info!(
            target: "framelink_core::pattern_scanner",
            signature = %signature.name,
            matches = matches.len(),
            duration_ms = self.last_stats.duration_ms,
            "Signature scan complete"
        );

        Ok(matches)
    }

    /// First match of a signature, or `PatternNotFound`
    pub fn find_signature(&mut self, signature: &SignaturePattern) -> Result<usize> {
        self.scan_signature(signature)?
            .first()
            .copied()
            .ok_or_else(|| Error::PatternNotFound(signature.name.to_string()))
    }
}

/// Front door used by the rest of the pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureScanner;

impl SignatureScanner {
    pub fn new() -> Self {
        Self
    }

    /// Start a scan session with a fresh region walk
    pub fn session(&self) -> Result<ScanSession> {
        ScanSession::capture()
    }

    /// Single-shot search over the current address space
    pub fn search(&self, bytes: &[u8], mask: &str) -> Result<Vec<usize>> {
        Ok(self.session()?.search(bytes, mask))
    }

    /// Every named export of a loaded module, parsed from its mapped image.
    /// Forwarded exports resolve to their target when the target module is
    /// loaded too, and are left out otherwise.
    pub fn resolve_exports(&self, module_name: &str) -> Result<HashMap<String, usize>> {
        let (base, _) = memory::module_range(module_name)?;
        // The loader supplies the ".dll" a forwarder's module name omits
        let locate = |module: &str| memory::module_range(module).ok().map(|(base, _)| base);
        // SAFETY: the loader keeps every located image mapped while loaded.
        let exports = unsafe { pe::resolve_exports_with(base, locate)? };
        debug!(
            target: "framelink_core::pattern_scanner",
            module = module_name,
            count = exports.len(),
            "Resolved exports"
        );
        Ok(exports)
    }
}
