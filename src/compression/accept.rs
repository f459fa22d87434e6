//! `Accept-Encoding` negotiation

use super::codec::Encoding;

/// Parsed `Accept-Encoding` header
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcceptEncoding {
    /// (coding, q) in header order, codings lowercased
    entries: Vec<(String, f32)>,
}

impl AcceptEncoding {
    /// Parse a header value; malformed entries are ignored
    pub fn parse(header: &str) -> Self {
        let entries = header
            .split(',')
            .filter_map(|item| {
                let mut parts = item.split(';');
                let coding = parts.next()?.trim().to_ascii_lowercase();
                if coding.is_empty() {
                    return None;
                }

                let mut q = 1.0_f32;
                for param in parts {
                    let Some((name, value)) = param.split_once('=') else {
                        continue;
                    };
                    if name.trim().eq_ignore_ascii_case("q") {
                        q = value.trim().parse().ok().filter(|q| (0.0..=1.0).contains(q))?;
                    }
                }
                Some((coding, q))
            })
            .collect();
        Self { entries }
    }

    fn weight(&self, coding: &str) -> Option<f32> {
        self.entries
            .iter()
            .find(|(c, _)| c == coding || (coding == "gzip" && c == "x-gzip"))
            .map(|(_, q)| *q)
    }

    /// Whether the client will take `encoding`; `q=0` refuses, `*` covers the rest
    pub fn accepts(&self, encoding: Encoding) -> bool {
        match encoding {
            Encoding::None => true,
            other => self
                .weight(other.name())
                .or_else(|| self.weight("*"))
                .is_some_and(|q| q > 0.0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_list() {
        let accept = AcceptEncoding::parse("gzip, deflate, br");
        assert!(accept.accepts(Encoding::Gzip));
        assert!(accept.accepts(Encoding::Deflate));
        assert!(accept.accepts(Encoding::Br));
    }

    #[test]
    fn test_q_zero_refuses() {
        let accept = AcceptEncoding::parse("br;q=0, gzip;q=0.8");
        assert!(!accept.accepts(Encoding::Br));
        assert!(accept.accepts(Encoding::Gzip));
        assert!(!accept.accepts(Encoding::Deflate));
    }

    #[test]
    fn test_wildcard() {
        let accept = AcceptEncoding::parse("*;q=0.5, gzip;q=0");
        assert!(accept.accepts(Encoding::Br));
        assert!(accept.accepts(Encoding::Deflate));
        assert!(!accept.accepts(Encoding::Gzip));
    }

    #[test]
    fn test_case_whitespace_and_alias() {
        let accept = AcceptEncoding::parse("  X-GZIP ;Q=1 ,BR");
        assert!(accept.accepts(Encoding::Gzip));
        assert!(accept.accepts(Encoding::Br));
    }

    #[test]
    fn test_malformed_entries_are_dropped() {
        let accept = AcceptEncoding::parse("gzip;q=abc, , br;q=2, deflate");
        assert!(!accept.accepts(Encoding::Gzip));
        assert!(!accept.accepts(Encoding::Br));
        assert!(accept.accepts(Encoding::Deflate));
    }

    #[test]
    fn test_empty_header() {
        let accept = AcceptEncoding::parse("");
        assert!(accept.is_empty());
        assert!(!accept.accepts(Encoding::Gzip));
        assert!(accept.accepts(Encoding::None));
    }
}
