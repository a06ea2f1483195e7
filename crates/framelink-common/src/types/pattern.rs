//! Signature pattern types

use std::borrow::Cow;

/// Mask character for a byte that must match exactly
pub const MASK_EXACT: char = 'x';
/// Mask character for a byte that always matches
pub const MASK_WILDCARD: char = '?';

/// A byte signature used to locate code that is not reachable by name.
///
/// `bytes` and `mask` are parallel: `mask[i] == 'x'` means `bytes[i]` must
/// match, `'?'` means any byte. Table entries are built in `const` context
/// from borrowed data; runtime patterns own their buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignaturePattern {
    pub name: Cow<'static, str>,
    pub bytes: Cow<'static, [u8]>,
    pub mask: Cow<'static, str>,
    /// Module whose image should contain the match, empty for "anywhere"
    pub module: Cow<'static, str>,
    pub description: Cow<'static, str>,
}

impl SignaturePattern {
    pub const fn from_static(
        name: &'static str,
        bytes: &'static [u8],
        mask: &'static str,
        module: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            name: Cow::Borrowed(name),
            bytes: Cow::Borrowed(bytes),
            mask: Cow::Borrowed(mask),
            module: Cow::Borrowed(module),
            description: Cow::Borrowed(description),
        }
    }

    /// Build a pattern from IDA-style text such as `"48 8B ?? 24"`.
    ///
    /// `?` and `??` are wildcards. Returns `None` on any malformed token.
    pub fn from_ida(name: &str, pattern: &str) -> Option<Self> {
        let mut bytes = Vec::new();
        let mut mask = String::new();

        for token in pattern.split_whitespace() {
            if token == "?" || token == "??" {
                bytes.push(0);
                mask.push(MASK_WILDCARD);
            } else {
                bytes.push(u8::from_str_radix(token, 16).ok()?);
                mask.push(MASK_EXACT);
            }
        }

        Some(Self {
            name: Cow::Owned(name.to_string()),
            bytes: Cow::Owned(bytes),
            mask: Cow::Owned(mask),
            module: Cow::Borrowed(""),
            description: Cow::Borrowed(""),
        })
    }

    pub fn with_module(mut self, module: &str) -> Self {
        self.module = Cow::Owned(module.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Cow::Owned(description.to_string());
        self
    }

    /// Mask as booleans, `true` for exact positions
    pub fn mask_bits(&self) -> Vec<bool> {
        self.mask.chars().map(|c| c == MASK_EXACT).collect()
    }

    /// Non-empty, equal lengths, and only `x`/`?` in the mask
    pub fn is_valid(&self) -> bool {
        !self.bytes.is_empty()
            && self.bytes.len() == self.mask.chars().count()
            && self
                .mask
                .chars()
                .all(|c| c == MASK_EXACT || c == MASK_WILDCARD)
    }

    pub fn wildcard_count(&self) -> usize {
        self.mask.chars().filter(|&c| c == MASK_WILDCARD).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_ida() {
        let p = SignaturePattern::from_ida("test", "48 89 ?? 24").unwrap();
        assert_eq!(&*p.bytes, &[0x48, 0x89, 0x00, 0x24]);
        assert_eq!(&*p.mask, "xx?x");
        assert_eq!(p.mask_bits(), vec![true, true, false, true]);
        assert!(p.is_valid());
        assert_eq!(p.wildcard_count(), 1);
    }

    #[test]
    fn test_from_ida_single_question_mark() {
        let p = SignaturePattern::from_ida("t", "E8 ? ? ? ? C3").unwrap();
        assert_eq!(&*p.mask, "x????x");
    }

    #[test]
    fn test_from_ida_rejects_garbage() {
        assert!(SignaturePattern::from_ida("t", "48 ZZ").is_none());
    }

    #[test]
    fn test_static_pattern() {
        const P: SignaturePattern =
            SignaturePattern::from_static("p", &[0xC3], "x", "dxgi.dll", "ret");
        assert!(P.is_valid());
        assert_eq!(P.module, "dxgi.dll");
    }

    #[test]
    fn test_invalid_when_lengths_differ() {
        let p = SignaturePattern::from_static("p", &[0x48, 0x8B], "x", "", "");
        assert!(!p.is_valid());
        let empty = SignaturePattern::from_static("e", &[], "", "", "");
        assert!(!empty.is_valid());
    }

    #[test]
    fn test_builder() {
        let p = SignaturePattern::from_ida("Present", "48 89")
            .unwrap()
            .with_module("dxgi.dll")
            .with_description("swap chain present");
        assert_eq!(p.module, "dxgi.dll");
        assert_eq!(p.description, "swap chain present");
    }
}
