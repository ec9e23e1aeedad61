//! MODE SENSE / MODE SELECT payload assembly and parsing (spec.md section
//! 4.4). Mirrors `PageHandler` in the original implementation.

use crate::codec;
use crate::error::{Asc, ScsiException, ScsiResult, SenseKey};
use std::collections::BTreeMap;

/// Implemented by any device that can be asked for its mode pages. Devices
/// populate `pages` for the requested `page` (or every page they support,
/// when `page == 0x3f`); `changeable` is derived from the CDB's PC field
/// (`0b01` means "return the mask of changeable bits", anything else means
/// "return current values").
pub trait ModePageSource {
    fn set_up_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, changeable: bool);

    fn supports_mode_select(&self) -> bool {
        false
    }

    fn supports_save_parameters(&self) -> bool {
        false
    }

    fn vendor(&self) -> &str;

    fn product(&self) -> &str;
}

/// Custom vendor mode page overrides, keyed by `(page, vendor, product)`.
/// An empty value *removes* the default page; a non-empty value *replaces*
/// it. Corresponds to `mode_page.<code>.<vendor>[:<product>]` properties.
#[derive(Debug, Default, Clone)]
pub struct ModePageOverrides {
    entries: BTreeMap<(u8, String, Option<String>), Vec<u8>>,
}

impl ModePageOverrides {
    pub fn insert(&mut self, page: u8, vendor: impl Into<String>, product: Option<String>, bytes: Vec<u8>) {
        self.entries.insert((page, vendor.into(), product), bytes);
    }

    fn lookup(&self, page: u8, vendor: &str, product: &str) -> Option<&Vec<u8>> {
        self.entries
            .get(&(page, vendor.to_string(), Some(product.to_string())))
            .or_else(|| self.entries.get(&(page, vendor.to_string(), None)))
    }
}

/// All-pages wildcard, per SPC.
pub const ALL_PAGES: u8 = 0x3f;

/// Assembles a MODE SENSE (6 or 10) response into `buf[header_len..]`,
/// returning the total response size (including the leading header the
/// caller is responsible for, at offsets before `header_len`).
///
/// `hard_cap` is 255 for the 6-byte form, 65535 for the 10-byte form.
pub fn add_mode_pages(
    source: &dyn ModePageSource,
    overrides: &ModePageOverrides,
    cdb: &[u8],
    buf: &mut [u8],
    header_len: usize,
    max_length: usize,
    hard_cap: usize,
) -> usize {
    let pc = (cdb[2] >> 6) & 0b11;
    let changeable = pc == 0b01;
    let requested_page = cdb[2] & 0x3f;

    let mut pages: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
    source.set_up_mode_pages(&mut pages, requested_page, changeable);

    for (code, bytes) in pages.iter_mut() {
        if let Some(over) = overrides.lookup(*code, source.vendor(), source.product()) {
            *bytes = over.clone();
        }
    }
    pages.retain(|_, bytes| !bytes.is_empty());

    let mut offset = header_len;
    let limit = max_length.min(hard_cap).min(buf.len());

    // Page 0 has no standardized length byte and is emitted last.
    let mut codes: Vec<u8> = pages.keys().copied().filter(|&c| c != 0).collect();
    codes.sort_unstable();
    if pages.contains_key(&0) {
        codes.push(0);
    }

    for code in codes {
        let bytes = &pages[&code];
        if code != 0 {
            if offset >= limit {
                break;
            }
            let remaining = limit - offset;
            let n = bytes.len().min(remaining);
            buf[offset..offset + n].copy_from_slice(&bytes[..n]);
            if n >= 2 {
                buf[offset] = code;
                buf[offset + 1] = (bytes.len() - 2) as u8;
            }
            offset += n;
        } else {
            let remaining = limit.saturating_sub(offset);
            let n = bytes.len().min(remaining);
            buf[offset..offset + n].copy_from_slice(&bytes[..n]);
            offset += n;
        }
    }

    offset
}

/// Validates and dispatches a MODE SELECT payload. `pf`/`sp` come from CDB
/// byte 1 bits 4 and 0; the device-specific payload interpretation is left
/// to `apply`.
pub fn validate_mode_select(
    source: &dyn ModePageSource,
    pf: bool,
    sp: bool,
) -> ScsiResult<()> {
    if !pf && !source.supports_mode_select() {
        return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
    }
    if sp && !source.supports_save_parameters() {
        return Err(ScsiException::new(SenseKey::IllegalRequest, Asc::SavingParametersNotSupported));
    }
    Ok(())
}

/// Splits a MODE SELECT parameter list into (block descriptor bytes, pages).
/// `descriptor_len` is the header+descriptor prefix size (4+8 for the 6-byte
/// form with one descriptor, 8+8 for the 10-byte form).
pub fn split_block_descriptor(payload: &[u8], header_len: usize, descriptor_len: usize) -> (&[u8], &[u8]) {
    let split = (header_len + descriptor_len).min(payload.len());
    (&payload[header_len..split], &payload[split..])
}

/// Reads the short-form (8-byte) block descriptor: 32-bit block count at
/// offset 0, 24-bit block size at offset 5.
pub fn parse_short_block_descriptor(desc: &[u8]) -> Option<(u32, u32)> {
    if desc.len() < 8 {
        return None;
    }
    Some((codec::get_u32(desc, 0), codec::get_u24(desc, 5)))
}

/// Walks a MODE SELECT page list (each entry: code byte, length byte,
/// `length` payload bytes) looking for `code`, returning its payload
/// (excluding the code/length header).
pub fn find_page(pages: &[u8], code: u8) -> Option<&[u8]> {
    let mut offset = 0;
    while offset + 2 <= pages.len() {
        let this_code = pages[offset] & 0x3f;
        let len = pages[offset + 1] as usize;
        let end = (offset + 2 + len).min(pages.len());
        if this_code == code {
            return Some(&pages[offset + 2..end]);
        }
        offset = end;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake;
    impl ModePageSource for Fake {
        fn set_up_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, _changeable: bool) {
            if page == 1 || page == ALL_PAGES {
                pages.insert(1, vec![1, 10, 0x26, 1, 0, 0, 0, 0, 1, 0, 218]);
            }
            if page == 2 || page == ALL_PAGES {
                pages.insert(2, vec![2, 2, 0, 0]);
            }
        }
        fn vendor(&self) -> &str {
            "TEST"
        }
        fn product(&self) -> &str {
            "DEVICE"
        }
    }

    #[test]
    fn assembles_requested_single_page() {
        let source = Fake;
        let overrides = ModePageOverrides::default();
        let cdb = [0x1a, 0, 1, 0, 255, 0];
        let mut buf = vec![0u8; 255];
        let size = add_mode_pages(&source, &overrides, &cdb, &mut buf, 4, 255, 255);
        assert_eq!(size, 4 + 11);
        assert_eq!(buf[4], 1);
        assert_eq!(buf[5], 9);
    }

    #[test]
    fn assembles_all_pages_with_zero_last() {
        let source = Fake;
        let overrides = ModePageOverrides::default();
        let cdb = [0x1a, 0, ALL_PAGES, 0, 255, 0];
        let mut buf = vec![0u8; 255];
        let size = add_mode_pages(&source, &overrides, &cdb, &mut buf, 4, 255, 255);
        assert_eq!(size, 4 + 11 + 4);
    }

    #[test]
    fn find_page_locates_requested_code_and_skips_others() {
        let pages = [1u8, 2, 0xaa, 0xbb, 3, 2, 0xcc, 0xdd];
        assert_eq!(find_page(&pages, 3), Some(&[0xcc, 0xdd][..]));
        assert_eq!(find_page(&pages, 9), None);
    }

    #[test]
    fn override_replaces_default_page() {
        let source = Fake;
        let mut overrides = ModePageOverrides::default();
        overrides.insert(2, "TEST", None, vec![2, 4, 9, 9, 9, 9]);
        let cdb = [0x1a, 0, 2, 0, 255, 0];
        let mut buf = vec![0u8; 255];
        let size = add_mode_pages(&source, &overrides, &cdb, &mut buf, 4, 255, 255);
        assert_eq!(size, 4 + 6);
        assert_eq!(&buf[4..10], &[2, 4, 9, 9, 9, 9]);
    }
}
