//! Splitting user-supplied `host[:port]` strings into a host and a port.

pub const DEFAULT_JAVA_PORT: u16 = 25565;
pub const DEFAULT_BEDROCK_PORT: u16 = 19132;

/// Parse an address string into `(host, port)`, applying `default_port` when
/// the input carries none.
///
/// Accepted shapes: `host`, `host:port`, `[v6]`, `[v6]:port`, and a bare
/// IPv6 literal (anything with more than one colon). A missing, empty, or
/// non-numeric port falls back to the default. Never fails; the host is
/// returned as written for the resolver to judge later.
pub fn parse_address(input: &str, default_port: u16) -> (String, u16) {
    let input = input.trim();

    if let Some(rest) = input.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_owned(), port);
        }
        // unmatched bracket, treat the whole thing as a host
        return (input.to_owned(), default_port);
    }

    // more than one colon with no brackets is a bare IPv6 literal
    if input.matches(':').count() > 1 {
        return (input.to_owned(), default_port);
    }

    match input.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().unwrap_or(default_port);
            (host.to_owned(), port)
        }
        None => (input.to_owned(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_only_gets_default_port() {
        assert_eq!(
            parse_address("mc.example.com", DEFAULT_JAVA_PORT),
            ("mc.example.com".to_owned(), 25565)
        );
    }

    #[test]
    fn explicit_port_is_kept() {
        assert_eq!(
            parse_address("mc.example.com:25580", DEFAULT_JAVA_PORT),
            ("mc.example.com".to_owned(), 25580)
        );
    }

    #[test]
    fn bracketed_v6_with_and_without_port() {
        assert_eq!(
            parse_address("[2001:db8::1]:19132", DEFAULT_JAVA_PORT),
            ("2001:db8::1".to_owned(), 19132)
        );
        assert_eq!(
            parse_address("[2001:db8::1]", DEFAULT_JAVA_PORT),
            ("2001:db8::1".to_owned(), 25565)
        );
    }

    #[test]
    fn bare_v6_literal_keeps_default_port() {
        assert_eq!(
            parse_address("2001:db8::1", DEFAULT_JAVA_PORT),
            ("2001:db8::1".to_owned(), 25565)
        );
    }

    #[test]
    fn bad_port_falls_back() {
        assert_eq!(
            parse_address("mc.example.com:notaport", DEFAULT_JAVA_PORT),
            ("mc.example.com".to_owned(), 25565)
        );
        assert_eq!(
            parse_address("mc.example.com:", DEFAULT_JAVA_PORT),
            ("mc.example.com".to_owned(), 25565)
        );
    }

    #[test]
    fn round_trip() {
        for (host, port) in [("play.example.org", 25565u16), ("10.0.0.7", 1234)] {
            let formatted = format!("{host}:{port}");
            assert_eq!(
                parse_address(&formatted, DEFAULT_JAVA_PORT),
                (host.to_owned(), port)
            );
        }
    }
}
