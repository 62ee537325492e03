//! Tag recognition: scanning a chunk boundary-safe `<…>` region and parsing
//! its name and attributes.

/// Longest tag text (between `<` and `>`) the scanner will wait for before
/// deciding a `<` was literal content.
pub(super) const MAX_TAG_SCAN: usize = 256;

/// Outcome of scanning at a `<`.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum TagScan<'a> {
    /// A full `<…>` region; `inner` excludes the angle brackets,
    /// `len` is the consumed length including both brackets.
    Complete { inner: &'a str, len: usize },
    /// The region may continue in the next chunk; hold the tail back.
    Incomplete,
    /// This `<` cannot open a tag; treat it as literal content.
    NotTagStart,
}

/// Scans `input`, which must start with `<`, for a complete tag region.
pub(super) fn scan_tag(input: &str) -> TagScan<'_> {
    debug_assert!(input.starts_with('<'));
    let Some(second) = input[1..].chars().next() else {
        return TagScan::Incomplete;
    };
    if !(second.is_ascii_alphabetic() || second == '_' || second == '/') {
        return TagScan::NotTagStart;
    }
    match input.find('>') {
        Some(gt) => TagScan::Complete {
            inner: &input[1..gt],
            len: gt + 1,
        },
        None if input.len() <= MAX_TAG_SCAN => TagScan::Incomplete,
        None => TagScan::NotTagStart,
    }
}

/// A parsed tag: name, closing flag, attribute pairs in declaration order.
#[derive(Debug, PartialEq, Eq)]
pub(super) struct RawTag {
    pub name: String,
    pub closing: bool,
    pub attrs: Vec<(String, String)>,
}

impl RawTag {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Parses the inner text of a tag region. Attribute grammar is strict:
/// `name="value"` pairs separated by whitespace, double quotes only.
pub(super) fn parse_tag(inner: &str) -> Result<RawTag, String> {
    let inner = inner.trim();
    let (closing, rest) = match inner.strip_prefix('/') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, inner),
    };
    let name_end = rest.find(|c: char| !is_name_char(c)).unwrap_or(rest.len());
    let name = &rest[..name_end];
    if name.is_empty() || !name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    {
        return Err(format!("invalid tag name in <{inner}>"));
    }
    let mut attrs = Vec::new();
    let mut rest = rest[name_end..].trim_start();
    if closing && !rest.is_empty() {
        return Err(format!("closing tag </{name}> must not carry attributes"));
    }
    while !rest.is_empty() {
        let key_end = rest.find(|c: char| !is_name_char(c)).unwrap_or(rest.len());
        let key = &rest[..key_end];
        if key.is_empty() {
            return Err(format!("malformed attribute in <{inner}>"));
        }
        rest = rest[key_end..].trim_start();
        let Some(after_eq) = rest.strip_prefix('=') else {
            return Err(format!("attribute '{key}' missing '=' in <{inner}>"));
        };
        let rest_q = after_eq.trim_start();
        let Some(after_quote) = rest_q.strip_prefix('"') else {
            return Err(format!("attribute '{key}' value must be double-quoted"));
        };
        let Some(close_q) = after_quote.find('"') else {
            return Err(format!("attribute '{key}' value missing closing quote"));
        };
        attrs.push((key.to_string(), after_quote[..close_q].to_string()));
        rest = after_quote[close_q + 1..].trim_start();
    }
    Ok(RawTag {
        name: name.to_string(),
        closing,
        attrs,
    })
}
