//! `Link`: caller/handler cross-references carried in `Link` headers.
//!
//! The wire grammar is an RFC 8288 subset: `<URL>; type="T"[; param=value]`
//! tuples, comma-joined within a header value and/or spread over multiple
//! values. Parameters other than `type` are ignored on decode. URLs must be
//! percent-encoded; an unencoded `;` or `,` in the URL is a parse error
//! (and is structurally unparseable anyway, since `,` separates tuples and
//! `;` separates parameters).

use std::fmt;

use thiserror::Error;

/// A bidirectional cross-reference between caller and handler, e.g. tying
/// an operation to the workflow that started it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Link {
    /// Percent-encoded URL. Opaque to the runtime.
    pub url: String,
    /// Type tag describing what the URL points at. Must not contain `;`,
    /// `,` or `"`.
    pub r#type: String,
}

/// Error parsing or emitting a `Link` header.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("invalid link header: {reason}")]
pub struct LinkError {
    reason: String,
}

impl LinkError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Link {
    /// Emit this link as one header value.
    pub fn to_header_value(&self) -> Result<String, LinkError> {
        if !is_valid_url(&self.url) {
            return Err(LinkError::new(format!(
                "url must be percent-encoded: {:?}",
                self.url
            )));
        }
        if self.r#type.contains([';', ',', '"']) {
            return Err(LinkError::new(format!(
                "type tag contains reserved characters: {:?}",
                self.r#type
            )));
        }
        let url = &self.url;
        let type_tag = &self.r#type;
        Ok(format!("<{url}>; type=\"{type_tag}\""))
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let url = &self.url;
        let type_tag = &self.r#type;
        write!(f, "<{url}> ({type_tag})")
    }
}

/// Parse every link out of a sequence of `Link` header values.
pub fn parse_header_values<'a>(
    values: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<Link>, LinkError> {
    let mut links = Vec::new();
    for value in values {
        parse_header_value_into(value, &mut links)?;
    }
    Ok(links)
}

/// Parse one `Link` header value, which may carry several comma-joined
/// links.
pub fn parse_header_value(value: &str) -> Result<Vec<Link>, LinkError> {
    let mut links = Vec::new();
    parse_header_value_into(value, &mut links)?;
    Ok(links)
}

fn parse_header_value_into(
    value: &str,
    links: &mut Vec<Link>,
) -> Result<(), LinkError> {
    for tuple in value.split(',') {
        let tuple = tuple.trim();
        if tuple.is_empty() {
            return Err(LinkError::new("empty link tuple"));
        }
        links.push(parse_tuple(tuple)?);
    }
    Ok(())
}

/// Parse a single `<URL>; type="T"` tuple.
fn parse_tuple(tuple: &str) -> Result<Link, LinkError> {
    let rest = tuple.strip_prefix('<').ok_or_else(|| {
        LinkError::new(format!("link must start with '<': {tuple:?}"))
    })?;
    let (url, params) = rest.split_once('>').ok_or_else(|| {
        LinkError::new(format!("unterminated url in link: {tuple:?}"))
    })?;
    if url.is_empty() {
        return Err(LinkError::new("empty url in link"));
    }
    if !is_valid_url(url) {
        return Err(LinkError::new(format!(
            "url must be percent-encoded: {url:?}"
        )));
    }

    let mut r#type = None;
    for param in params.split(';') {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        let Some((key, value)) = param.split_once('=') else {
            return Err(LinkError::new(format!(
                "malformed link parameter: {param:?}"
            )));
        };
        // Parameters other than `type` are ignored.
        if key.trim() != "type" {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        r#type = Some(value.to_owned());
    }

    let r#type = r#type.ok_or_else(|| {
        LinkError::new(format!("link is missing a type parameter: {tuple:?}"))
    })?;
    Ok(Link {
        url: url.to_owned(),
        r#type,
    })
}

/// A URL is acceptable on this wire iff its reserved separators are
/// percent-encoded and it carries no whitespace or control characters.
fn is_valid_url(url: &str) -> bool {
    !url.is_empty()
        && url.chars().all(|c| {
            !c.is_whitespace()
                && !c.is_control()
                && !matches!(c, ';' | ',' | '<' | '>')
        })
}

#[cfg(test)]
mod test {
    use super::*;

    fn link(url: &str, r#type: &str) -> Link {
        Link {
            url: url.to_owned(),
            r#type: r#type.to_owned(),
        }
    }

    #[test]
    fn single_link_roundtrip() {
        let original =
            link("https://example.com/caller?id=a%2Cb", "org.test.Ref");
        let value = original.to_header_value().unwrap();
        assert_eq!(
            value,
            "<https://example.com/caller?id=a%2Cb>; type=\"org.test.Ref\""
        );
        let parsed = parse_header_value(&value).unwrap();
        assert_eq!(parsed, vec![original]);
    }

    #[test]
    fn comma_joined_and_separate_values_parse_alike() {
        let a = link("https://example.com/a", "A");
        let b = link("https://example.com/b", "B");
        let joined = format!(
            "{}, {}",
            a.to_header_value().unwrap(),
            b.to_header_value().unwrap()
        );

        let parsed = parse_header_value(&joined).unwrap();
        assert_eq!(parsed, vec![a.clone(), b.clone()]);

        let parsed = parse_header_values([
            a.to_header_value().unwrap().as_str(),
            b.to_header_value().unwrap().as_str(),
        ])
        .unwrap();
        assert_eq!(parsed, vec![a, b]);
    }

    #[test]
    fn unknown_parameters_are_ignored() {
        let parsed = parse_header_value(
            "<https://example.com/x>; rel=\"next\"; type=\"T\"; foo=bar",
        )
        .unwrap();
        assert_eq!(parsed, vec![link("https://example.com/x", "T")]);
    }

    #[test]
    fn malformed_values_are_rejected() {
        for value in [
            "",
            "https://example.com/x; type=\"T\"",
            "<>; type=\"T\"",
            "<https://example.com/x>",
            "<https://example.com/x>; rel=\"next\"",
            "<https://example.com/x; type=\"T\"",
            "<https://example.com/a b>; type=\"T\"",
        ] {
            assert!(
                parse_header_value(value).is_err(),
                "should reject {value:?}"
            );
        }
    }

    /// An unencoded `,` in the URL splits the tuple apart and must fail
    /// rather than mis-parse.
    #[test]
    fn unencoded_separators_in_url_fail() {
        let raw = "<https://example.com/a,b>; type=\"T\"";
        assert!(parse_header_value(raw).is_err());

        let sneaky = link("https://example.com/a,b", "T");
        assert!(sneaky.to_header_value().is_err());

        let sneaky = link("https://example.com/a;b", "T");
        assert!(sneaky.to_header_value().is_err());
    }

    #[test]
    fn reserved_type_tags_fail_to_emit() {
        assert!(link("https://example.com", "a,b").to_header_value().is_err());
        assert!(link("https://example.com", "a;b").to_header_value().is_err());
    }

    #[test]
    fn link_list_roundtrip_proptest() {
        use proptest::{collection, prelude::*};

        // Valid percent-encoded URL characters and comma/semicolon-free
        // type tags, per the wire grammar.
        let url = "https?://[a-z0-9./%-]{1,24}";
        let type_tag = "[A-Za-z0-9._-]{1,16}";
        let links = collection::vec(
            (url, type_tag).prop_map(|(url, r#type)| Link { url, r#type }),
            1..5,
        );

        proptest!(|(links in links)| {
            let values = links
                .iter()
                .map(|link| link.to_header_value().unwrap())
                .collect::<Vec<_>>();

            // One tuple per header value.
            let parsed =
                parse_header_values(values.iter().map(String::as_str))
                    .unwrap();
            prop_assert_eq!(&parsed, &links);

            // And comma-joined into a single value.
            let parsed = parse_header_value(&values.join(", ")).unwrap();
            prop_assert_eq!(&parsed, &links);
        });
    }
}
