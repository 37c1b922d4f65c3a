//! Minimal glob matching for KEYS and HOOKS patterns: `*` matches any run
//! of characters, `?` matches exactly one.

pub fn matches(pattern: &str, name: &str) -> bool {
    matches_bytes(pattern.as_bytes(), name.as_bytes())
}

fn matches_bytes(pat: &[u8], name: &[u8]) -> bool {
    match (pat.first(), name.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            matches_bytes(&pat[1..], name) || (!name.is_empty() && matches_bytes(pat, &name[1..]))
        }
        (Some(b'?'), Some(_)) => matches_bytes(&pat[1..], &name[1..]),
        (Some(p), Some(n)) if p == n => matches_bytes(&pat[1..], &name[1..]),
        _ => false,
    }
}
