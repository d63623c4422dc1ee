//! Header fingerprints used to correlate behavior independently of address.
//!
//! These digests are dictionary keys, not security tokens.

use sha2::{Digest, Sha256};
use crate::core::request::RequestDescriptor;

/// Headers mixed into the client fingerprint, in order.
pub const FINGERPRINT_HEADERS: &[&str] = &["user-agent", "accept-language", "accept-encoding", "dnt"];

/// SHA-256 over the identity and the fingerprint headers, hex encoded.
pub fn generate_fingerprint(client_id: &str, req: &RequestDescriptor) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_id.as_bytes());
    for name in FINGERPRINT_HEADERS {
        // separator keeps ("ab", "") and ("a", "b") apart
        hasher.update([0u8]);
        hasher.update(req.header(name).unwrap_or_default().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Short digest of which headers a request carried.
pub fn header_digest(req: &RequestDescriptor) -> String {
    let mut names: Vec<&str> = req.headers.keys().map(String::as_str).collect();
    names.sort_unstable();
    let digest = format!("{:x}", Sha256::digest(names.join(",").as_bytes()));
    digest[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn browser(ua: &str) -> RequestDescriptor {
        RequestDescriptor::new("GET", "/")
            .with_header("User-Agent", ua)
            .with_header("Accept-Language", "en-GB")
            .with_header("Accept-Encoding", "gzip")
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = generate_fingerprint("1.2.3.4", &browser("Mozilla/5.0"));
        let b = generate_fingerprint("1.2.3.4", &browser("Mozilla/5.0"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_differs_on_headers_and_identity() {
        let base = generate_fingerprint("1.2.3.4", &browser("Mozilla/5.0"));
        assert_ne!(base, generate_fingerprint("1.2.3.4", &browser("curl/8.0")));
        assert_ne!(base, generate_fingerprint("5.6.7.8", &browser("Mozilla/5.0")));
        let with_dnt = browser("Mozilla/5.0").with_header("DNT", "1");
        assert_ne!(base, generate_fingerprint("1.2.3.4", &with_dnt));
    }

    #[test]
    fn test_header_digest_ignores_order_and_values() {
        let a = RequestDescriptor::new("GET", "/").with_header("a", "1").with_header("b", "2");
        let b = RequestDescriptor::new("GET", "/").with_header("b", "x").with_header("a", "y");
        assert_eq!(header_digest(&a), header_digest(&b));
        assert_eq!(header_digest(&a).len(), 16);
    }
}
