//! Single-pass scanner for directive tags embedded in free text.
//!
//! Only tag names from the known set are recognised; everything else
//! (prose, markdown, unrelated HTML) is skipped. A tag whose closing marker
//! never appears is reported as malformed and scanning resumes right after
//! its opening `>`.

use std::collections::HashSet;

/// A recognised tag with its attributes and raw inner text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Tag<'a> {
    pub name: &'a str,
    pub attrs: Vec<(&'a str, &'a str)>,
    pub content: &'a str,
    pub offset: usize,
}

impl<'a> Tag<'a> {
    pub fn attr(&self, key: &str) -> Option<&'a str> {
        self.attrs
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| *value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token<'a> {
    Tag(Tag<'a>),
    Malformed {
        name: &'a str,
        offset: usize,
        reason: String,
    },
}

pub(crate) struct TagScanner<'a> {
    src: &'a str,
    pos: usize,
    names: &'a [&'a str],
    /// Names whose closing marker is known to be absent past some point.
    /// Once a search fails it fails for every later position too.
    unclosed: HashSet<&'a str>,
}

impl<'a> TagScanner<'a> {
    pub fn new(src: &'a str, names: &'a [&'a str]) -> Self {
        Self {
            src,
            pos: 0,
            names,
            unclosed: HashSet::new(),
        }
    }

    fn match_name(&self, at: usize) -> Option<&'a str> {
        let names: &'a [&'a str] = self.names;
        let rest = self.src.get(at + 1..)?;
        names
            .iter()
            .filter(|name| rest.starts_with(**name))
            .filter(|name| {
                matches!(
                    rest[name.len()..].chars().next(),
                    Some(c) if c.is_whitespace() || c == '>' || c == '/'
                )
            })
            .max_by_key(|name| name.len())
            .copied()
    }

    fn close_marker_from(&mut self, name: &'a str, from: usize) -> Option<(usize, usize)> {
        if self.unclosed.contains(name) {
            return None;
        }
        let marker = format!("</{}>", name);
        match self.src[from..].find(&marker) {
            Some(idx) => Some((from + idx, from + idx + marker.len())),
            None => {
                self.unclosed.insert(name);
                None
            }
        }
    }
}

enum OpenTag<'a> {
    /// Attributes plus the byte offset just past `>` and whether it was `/>`.
    Complete {
        attrs: Vec<(&'a str, &'a str)>,
        end: usize,
        self_closing: bool,
    },
    Broken(String),
}

fn parse_open_tag(src: &str, start: usize) -> OpenTag<'_> {
    let bytes = src.as_bytes();
    let mut i = start;
    let mut attrs = Vec::new();

    loop {
        while i < bytes.len() && (bytes[i] as char).is_ascii_whitespace() {
            i += 1;
        }
        match bytes.get(i) {
            None => return OpenTag::Broken("unterminated opening tag".to_string()),
            Some(b'>') => {
                return OpenTag::Complete {
                    attrs,
                    end: i + 1,
                    self_closing: false,
                }
            }
            Some(b'/') if bytes.get(i + 1) == Some(&b'>') => {
                return OpenTag::Complete {
                    attrs,
                    end: i + 2,
                    self_closing: true,
                }
            }
            Some(_) => {}
        }

        let name_start = i;
        while i < bytes.len()
            && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'-' | b'_' | b':'))
        {
            i += 1;
        }
        if i == name_start {
            return OpenTag::Broken(format!(
                "unexpected character '{}' in opening tag",
                src[i..].chars().next().unwrap_or('?')
            ));
        }
        let key = &src[name_start..i];

        while i < bytes.len() && (bytes[i] as char).is_ascii_whitespace() {
            i += 1;
        }
        if bytes.get(i) != Some(&b'=') {
            // Bare attribute such as `<write path="a" overwrite>`
            attrs.push((key, ""));
            continue;
        }
        i += 1;
        while i < bytes.len() && (bytes[i] as char).is_ascii_whitespace() {
            i += 1;
        }
        let quote = match bytes.get(i) {
            Some(q @ (b'"' | b'\'')) => *q,
            _ => return OpenTag::Broken(format!("attribute '{}' is not quoted", key)),
        };
        let value_start = i + 1;
        let Some(len) = src[value_start..].find(quote as char) else {
            return OpenTag::Broken(format!("attribute '{}' is not terminated", key));
        };
        attrs.push((key, &src[value_start..value_start + len]));
        i = value_start + len + 1;
    }
}

impl<'a> Iterator for TagScanner<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rel = self.src.get(self.pos..)?.find('<')?;
            let at = self.pos + rel;
            let Some(name) = self.match_name(at) else {
                self.pos = at + 1;
                continue;
            };

            match parse_open_tag(self.src, at + 1 + name.len()) {
                OpenTag::Broken(reason) => {
                    self.pos = at + 1;
                    return Some(Token::Malformed {
                        name,
                        offset: at,
                        reason,
                    });
                }
                OpenTag::Complete {
                    attrs,
                    end,
                    self_closing: true,
                } => {
                    self.pos = end;
                    return Some(Token::Tag(Tag {
                        name,
                        attrs,
                        content: "",
                        offset: at,
                    }));
                }
                OpenTag::Complete { attrs, end, .. } => {
                    let Some((close_start, close_end)) = self.close_marker_from(name, end) else {
                        self.pos = end;
                        return Some(Token::Malformed {
                            name,
                            offset: at,
                            reason: format!("missing closing </{}>", name),
                        });
                    };
                    self.pos = close_end;
                    return Some(Token::Tag(Tag {
                        name,
                        attrs,
                        content: &self.src[end..close_start],
                        offset: at,
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMES: &[&str] = &["write", "delete", "add-dependency"];

    fn tags(src: &str) -> Vec<Token<'_>> {
        TagScanner::new(src, NAMES).collect()
    }

    #[test]
    fn skips_prose_and_unknown_tags() {
        let tokens = tags("hello <div>x</div> <writer> <write path=\"a.ts\">A</write> bye");
        assert_eq!(tokens.len(), 1);
        let Token::Tag(tag) = &tokens[0] else {
            panic!("expected tag");
        };
        assert_eq!(tag.name, "write");
        assert_eq!(tag.attr("path"), Some("a.ts"));
        assert_eq!(tag.content, "A");
    }

    #[test]
    fn reads_single_quoted_and_bare_attributes() {
        let tokens = tags("<write path='a b.ts' force >x</write>");
        let Token::Tag(tag) = &tokens[0] else {
            panic!("expected tag");
        };
        assert_eq!(tag.attr("path"), Some("a b.ts"));
        assert_eq!(tag.attr("force"), Some(""));
    }

    #[test]
    fn self_closing_tag_has_empty_content() {
        let tokens = tags("<delete path=\"x.ts\" /> then <delete path=\"y.ts\"></delete>");
        assert_eq!(tokens.len(), 2);
        assert!(matches!(&tokens[0], Token::Tag(t) if t.content.is_empty()));
        assert!(matches!(&tokens[1], Token::Tag(t) if t.attr("path") == Some("y.ts")));
    }

    #[test]
    fn unclosed_tag_is_malformed_and_scanning_continues() {
        let tokens = tags("<write path=\"a.ts\">never closed <delete path=\"b.ts\"></delete>");
        assert_eq!(tokens.len(), 2);
        assert!(matches!(&tokens[0], Token::Malformed { name: "write", .. }));
        assert!(matches!(&tokens[1], Token::Tag(t) if t.name == "delete"));
    }

    #[test]
    fn unquoted_attribute_is_malformed() {
        let tokens = tags("<write path=a.ts>x</write>");
        assert!(matches!(&tokens[0], Token::Malformed { reason, .. } if reason.contains("not quoted")));
    }

    #[test]
    fn content_may_contain_other_markup() {
        let tokens = tags("<write path=\"a.tsx\">const x = <div>{1 < 2}</div>;</write>");
        let Token::Tag(tag) = &tokens[0] else {
            panic!("expected tag");
        };
        assert_eq!(tag.content, "const x = <div>{1 < 2}</div>;");
    }
}
