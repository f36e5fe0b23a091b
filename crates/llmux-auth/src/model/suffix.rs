/// A model name split from its trailing thinking suffix.
///
/// `g25p(8192)` parses to base `g25p`, suffix `8192`; `model()` parses to an
/// empty suffix; an unterminated `(` is not a suffix and stays part of the
/// base name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedModel<'a> {
    pub base: &'a str,
    pub suffix: Option<&'a str>,
}

impl ParsedModel<'_> {
    pub fn has_suffix(&self) -> bool {
        self.suffix.is_some()
    }
}

pub fn parse_suffix(model: &str) -> ParsedModel<'_> {
    if let Some(stripped) = model.strip_suffix(')')
        && let Some(open) = stripped.rfind('(')
    {
        return ParsedModel {
            base: &stripped[..open],
            suffix: Some(&stripped[open + 1..]),
        };
    }
    ParsedModel {
        base: model,
        suffix: None,
    }
}

/// Attach a suffix to a base name. Empty suffixes are dropped rather than
/// rendered as `model()`.
pub fn with_suffix(base: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(s) if !s.is_empty() => format!("{base}({s})"),
        _ => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_name_has_no_suffix() {
        let parsed = parse_suffix("gemini-2.5-pro");
        assert_eq!(parsed.base, "gemini-2.5-pro");
        assert_eq!(parsed.suffix, None);
    }

    #[test]
    fn trailing_parens_parse() {
        for (input, base, suffix) in [
            ("g25p(8192)", "g25p", "8192"),
            ("gpt-5.2(xhigh)", "gpt-5.2", "xhigh"),
            ("model(auto)", "model", "auto"),
            ("model(none)", "model", "none"),
        ] {
            let parsed = parse_suffix(input);
            assert_eq!(parsed.base, base);
            assert_eq!(parsed.suffix, Some(suffix));
        }
    }

    #[test]
    fn empty_suffix_is_a_suffix() {
        let parsed = parse_suffix("model()");
        assert_eq!(parsed.base, "model");
        assert_eq!(parsed.suffix, Some(""));
        assert!(parsed.has_suffix());
    }

    #[test]
    fn unterminated_paren_is_not_a_suffix() {
        let parsed = parse_suffix("from(high");
        assert_eq!(parsed.base, "from(high");
        assert_eq!(parsed.suffix, None);
    }

    #[test]
    fn close_without_open_is_not_a_suffix() {
        let parsed = parse_suffix("weird)");
        assert_eq!(parsed.base, "weird)");
        assert_eq!(parsed.suffix, None);
    }

    #[test]
    fn nested_parens_take_the_last_group() {
        let parsed = parse_suffix("m(a)(b)");
        assert_eq!(parsed.base, "m(a)");
        assert_eq!(parsed.suffix, Some("b"));
    }

    #[test]
    fn with_suffix_drops_empty() {
        assert_eq!(with_suffix("m", Some("high")), "m(high)");
        assert_eq!(with_suffix("m", Some("")), "m");
        assert_eq!(with_suffix("m", None), "m");
    }
}
