//! Hostname helpers.

/// Return `hostname` with any domain part removed.
pub fn strip_domain(hostname: &str) -> &str {
    match hostname.split_once('.') {
        Some((host, _domain)) => host,
        None => hostname,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_domain() {
        assert_eq!(strip_domain("node01.example.com"), "node01");
        assert_eq!(strip_domain("node01"), "node01");
        assert_eq!(strip_domain("a.b.c"), "a");
    }
}
