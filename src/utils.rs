//! Utility functions.

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be zero or a power of two; zero leaves the value unchanged.
pub fn align_up(addr: u64, align: u64) -> u64 {
    if align <= 1 {
        return addr;
    }
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

/// Checked variant of [`align_up`] for values that may sit at the top of the address space.
pub fn checked_align_up(addr: u64, align: u64) -> Option<u64> {
    if align <= 1 {
        return Some(addr);
    }
    addr.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Reads a little-endian unsigned integer of `size` bytes at `offset`.
pub fn read_le(data: &[u8], offset: usize, size: usize) -> Option<u64> {
    let bytes = data.get(offset..offset.checked_add(size)?)?;
    let mut buf = [0u8; 8];
    buf[..size].copy_from_slice(bytes);
    Some(u64::from_le_bytes(buf))
}

/// Writes the low `size` bytes of `value` at `offset`, little-endian.
/// Returns `false` when the destination is out of bounds.
pub fn write_le(data: &mut [u8], offset: usize, size: usize, value: u64) -> bool {
    let Some(end) = offset.checked_add(size) else {
        return false;
    };
    match data.get_mut(offset..end) {
        Some(dst) => {
            dst.copy_from_slice(&value.to_le_bytes()[..size]);
            true
        }
        None => false,
    }
}

/// Copies a NUL-padded fixed-size name field into a `String`.
pub fn fixed_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Builds a NUL-padded fixed-size name field, truncating long names.
pub fn name_field<const N: usize>(name: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = name.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(7, 0), 7);
        assert_eq!(checked_align_up(u64::MAX - 2, 16), None);
    }

    #[test]
    fn little_endian_helpers() {
        let mut buf = [0u8; 8];
        assert!(write_le(&mut buf, 2, 4, 0xAABBCCDD));
        assert_eq!(read_le(&buf, 2, 4), Some(0xAABBCCDD));
        assert!(!write_le(&mut buf, 6, 4, 1));
        assert_eq!(read_le(&buf, 7, 2), None);
    }

    #[test]
    fn name_fields_round_trip() {
        let field: [u8; 8] = name_field(".uvm0");
        assert_eq!(fixed_name(&field), ".uvm0");
        let long: [u8; 8] = name_field(".averylongname");
        assert_eq!(fixed_name(&long), ".averylo");
    }
}
