use crate::key::CACHE_KEY_LEN;

/// Embed a cache key into a kernel symbol name.
///
/// Shape: `{primal_name}{key}_{checksum(primal_name) ^ checksum(key)}`,
/// where a checksum is the sum of a string's byte values. Keys of the wrong
/// length pass the name through untouched.
pub fn mangle_kernel_name(primal_name: &str, key: &str) -> String {
    if key.len() != CACHE_KEY_LEN {
        return primal_name.to_string();
    }
    let checksum = byte_sum(primal_name) ^ byte_sum(key);
    format!("{primal_name}{key}_{checksum}")
}

/// Split a mangled name back into `(primal_name, key)`.
///
/// Returns `None` for anything that is not a well-formed mangling,
/// including names whose checksum suffix does not validate.
pub fn demangle_kernel_name(mangled: &str) -> Option<(String, String)> {
    const MIN_MANGLED_LEN: usize = CACHE_KEY_LEN + 2;
    if mangled.len() < MIN_MANGLED_LEN {
        return None;
    }

    let pos = mangled.rfind('_')?;
    let checksum: u64 = mangled.get(pos + 1..)?.parse().ok()?;
    let primal_len = pos.checked_sub(CACHE_KEY_LEN)?;
    let primal_name = mangled.get(..primal_len)?;
    let key = mangled.get(primal_len..pos)?;

    if byte_sum(primal_name) ^ byte_sum(key) != checksum {
        return None;
    }
    Some((primal_name.to_string(), key.to_string()))
}

fn byte_sum(s: &str) -> u64 {
    s.bytes().map(u64::from).sum()
}
