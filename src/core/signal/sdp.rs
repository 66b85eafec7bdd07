//! SDP candidate munging.
//!
//! Browsers behind mDNS obfuscation publish host candidates whose address
//! token is a `.local` name the remote side cannot resolve off-link.
//! When the user supplies a LAN address, those tokens are rewritten in
//! place so two machines on the same network can connect directly.

use std::net::Ipv4Addr;

/// Replace the address token of `.local` host candidates with `ip`.
///
/// Only `a=candidate:` lines whose fifth token ends in `.local` and whose
/// candidate type is `host` are touched; everything else is passed
/// through byte-identical, including line endings. `None` is a no-op.
pub fn rewrite_host_candidates(description: &str, ip: Option<Ipv4Addr>) -> String {
    let Some(ip) = ip else {
        return description.to_string();
    };
    let replacement = ip.to_string();

    let mut out = String::with_capacity(description.len());
    let mut rest = description;
    loop {
        let (line, terminator, remaining) = match rest.find('\n') {
            Some(idx) => {
                let raw = &rest[..idx];
                if let Some(stripped) = raw.strip_suffix('\r') {
                    (stripped, "\r\n", &rest[idx + 1..])
                } else {
                    (raw, "\n", &rest[idx + 1..])
                }
            }
            None => (rest, "", ""),
        };

        out.push_str(&rewrite_line(line, &replacement));
        out.push_str(terminator);

        if remaining.is_empty() {
            break;
        }
        rest = remaining;
    }
    out
}

fn rewrite_line(line: &str, replacement: &str) -> String {
    if !line.starts_with("a=candidate:") {
        return line.to_string();
    }

    let tokens: Vec<&str> = line.split(' ').collect();
    let is_host = tokens
        .windows(2)
        .any(|w| w[0] == "typ" && w[1] == "host");
    if tokens.len() < 5 || !is_host || !tokens[4].ends_with(".local") {
        return line.to_string();
    }

    let mut rewritten = tokens;
    rewritten[4] = replacement;
    rewritten.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        a=candidate:1467250027 1 udp 2122260223 f2c1e9b0-bd95-4b26.local 46243 typ host generation 0\r\n\
        a=candidate:1853887674 1 udp 1518280447 198.51.100.4 47199 typ srflx raddr 0.0.0.0 rport 0\r\n\
        a=end-of-candidates\r\n";

    #[test]
    fn rewrites_only_mdns_host_candidates() {
        let out = rewrite_host_candidates(OFFER, Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert!(out.contains("192.168.1.20 46243 typ host"));
        // The srflx candidate keeps its real address.
        assert!(out.contains("198.51.100.4 47199 typ srflx"));
        assert!(!out.contains(".local"));
    }

    #[test]
    fn absent_override_is_byte_identical() {
        assert_eq!(rewrite_host_candidates(OFFER, None), OFFER);
    }

    #[test]
    fn non_local_host_candidates_untouched() {
        let sdp = "a=candidate:1 1 udp 2122 10.0.0.5 9999 typ host\r\n";
        assert_eq!(
            rewrite_host_candidates(sdp, Some(Ipv4Addr::new(192, 168, 0, 1))),
            sdp
        );
    }

    #[test]
    fn preserves_bare_newlines() {
        let sdp = "a=candidate:9 1 udp 1 host-name.local 1 typ host\nv=0";
        let out = rewrite_host_candidates(sdp, Some(Ipv4Addr::new(172, 16, 0, 3)));
        assert_eq!(out, "a=candidate:9 1 udp 1 172.16.0.3 1 typ host\nv=0");
    }
}
