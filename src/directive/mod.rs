//! Directive parsing
//!
//! Turns a raw model response into an ordered list of typed edit
//! operations. Prose, markdown and unknown tags around the directives are
//! ignored; malformed directives are skipped with a warning.

mod tokenizer;

use crate::util::check_relative;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokenizer::{Tag, TagScanner, Token};

const TAG_WRITE: &str = "write";
const TAG_RENAME: &str = "rename";
const TAG_DELETE: &str = "delete";
const TAG_ADD_DEPENDENCY: &str = "add-dependency";
const TAG_EXECUTE_SQL: &str = "execute-sql";
const TAG_COMMAND: &str = "command";
const TAG_CHAT_SUMMARY: &str = "chat-summary";

const KNOWN_TAGS: &[&str] = &[
    TAG_WRITE,
    TAG_RENAME,
    TAG_DELETE,
    TAG_ADD_DEPENDENCY,
    TAG_EXECUTE_SQL,
    TAG_COMMAND,
    TAG_CHAT_SUMMARY,
];

/// A project-relative path with `/` separators that cannot escape the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelPath(String);

impl RelPath {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut normalized = raw.trim().replace('\\', "/");
        while let Some(rest) = normalized.strip_prefix("./") {
            normalized = rest.to_string();
        }
        let normalized = normalized
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .collect::<Vec<_>>()
            .join("/");
        if raw.trim().starts_with('/') || raw.trim().starts_with('\\') {
            return Err(format!("Absolute paths are not allowed: {}", raw.trim()));
        }
        check_relative(&normalized)?;
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host path built from the `/`-separated segments.
    pub fn to_path_buf(&self) -> PathBuf {
        self.0.split('/').collect()
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RelPath {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RelPath> for String {
    fn from(value: RelPath) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: RelPath,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRename {
    pub from: RelPath,
    pub to: RelPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDelete {
    pub path: RelPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddDependency {
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSql {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Rebuild,
    Restart,
    Refresh,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Rebuild => "rebuild",
            CommandKind::Restart => "restart",
            CommandKind::Refresh => "refresh",
        }
    }
}

impl FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "rebuild" => Ok(CommandKind::Rebuild),
            "restart" => Ok(CommandKind::Restart),
            "refresh" => Ok(CommandKind::Refresh),
            other => Err(format!("unknown command type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiCommand {
    pub kind: CommandKind,
}

/// One parsed edit operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Directive {
    Write(FileWrite),
    Rename(FileRename),
    Delete(FileDelete),
    AddDependency(AddDependency),
    ExecuteSql(ExecuteSql),
    Command(UiCommand),
}

impl Directive {
    pub fn write(path: &str, content: &str) -> Result<Self, String> {
        Ok(Directive::Write(FileWrite {
            path: RelPath::parse(path)?,
            content: content.to_string(),
            description: None,
        }))
    }

    pub fn rename(from: &str, to: &str) -> Result<Self, String> {
        Ok(Directive::Rename(FileRename {
            from: RelPath::parse(from)?,
            to: RelPath::parse(to)?,
        }))
    }

    pub fn delete(path: &str) -> Result<Self, String> {
        Ok(Directive::Delete(FileDelete {
            path: RelPath::parse(path)?,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseWarning {
    pub tag: String,
    /// Byte offset of the offending tag in the response.
    pub offset: usize,
    pub message: String,
}

/// Everything extracted from one response, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedResponse {
    pub directives: Vec<Directive>,
    pub warnings: Vec<ParseWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_summary: Option<String>,
}

impl ParsedResponse {
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    pub fn writes(&self) -> impl Iterator<Item = &FileWrite> {
        self.directives.iter().filter_map(|d| match d {
            Directive::Write(w) => Some(w),
            _ => None,
        })
    }

    pub fn renames(&self) -> impl Iterator<Item = &FileRename> {
        self.directives.iter().filter_map(|d| match d {
            Directive::Rename(r) => Some(r),
            _ => None,
        })
    }

    pub fn deletes(&self) -> impl Iterator<Item = &FileDelete> {
        self.directives.iter().filter_map(|d| match d {
            Directive::Delete(del) => Some(del),
            _ => None,
        })
    }

    /// All packages across every dependency tag, flattened in encounter order.
    /// Duplicates are kept.
    pub fn dependencies(&self) -> Vec<String> {
        self.directives
            .iter()
            .filter_map(|d| match d {
                Directive::AddDependency(dep) => Some(dep.packages.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn sql(&self) -> impl Iterator<Item = &ExecuteSql> {
        self.directives.iter().filter_map(|d| match d {
            Directive::ExecuteSql(sql) => Some(sql),
            _ => None,
        })
    }

    pub fn commands(&self) -> Vec<CommandKind> {
        self.directives
            .iter()
            .filter_map(|d| match d {
                Directive::Command(cmd) => Some(cmd.kind),
                _ => None,
            })
            .collect()
    }
}

/// Parse every directive out of a raw response.
pub fn parse_response(raw: &str) -> ParsedResponse {
    let mut parsed = ParsedResponse::default();

    for token in TagScanner::new(raw, KNOWN_TAGS) {
        let tag = match token {
            Token::Tag(tag) => tag,
            Token::Malformed {
                name,
                offset,
                reason,
            } => {
                push_warning(&mut parsed, name, offset, reason);
                continue;
            }
        };

        if tag.name == TAG_CHAT_SUMMARY {
            let summary = tag.content.trim();
            if !summary.is_empty() {
                parsed.chat_summary = Some(summary.to_string());
            }
            continue;
        }

        match directive_from_tag(&tag) {
            Ok(directive) => parsed.directives.push(directive),
            Err(reason) => push_warning(&mut parsed, tag.name, tag.offset, reason),
        }
    }

    tracing::debug!(
        directives = parsed.directives.len(),
        warnings = parsed.warnings.len(),
        "parsed response"
    );
    parsed
}

fn push_warning(parsed: &mut ParsedResponse, tag: &str, offset: usize, message: String) {
    tracing::warn!(tag, offset, "skipping malformed directive: {}", message);
    parsed.warnings.push(ParseWarning {
        tag: tag.to_string(),
        offset,
        message,
    });
}

fn required_attr<'a>(tag: &Tag<'a>, key: &str) -> Result<&'a str, String> {
    match tag.attr(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(format!("<{}> is missing the '{}' attribute", tag.name, key)),
    }
}

fn optional_attr(tag: &Tag<'_>, key: &str) -> Option<String> {
    tag.attr(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn directive_from_tag(tag: &Tag<'_>) -> Result<Directive, String> {
    match tag.name {
        TAG_WRITE => Ok(Directive::Write(FileWrite {
            path: RelPath::parse(required_attr(tag, "path")?)?,
            content: strip_code_fences(tag.content.trim()),
            description: optional_attr(tag, "description"),
        })),
        TAG_RENAME => Ok(Directive::Rename(FileRename {
            from: RelPath::parse(required_attr(tag, "from")?)?,
            to: RelPath::parse(required_attr(tag, "to")?)?,
        })),
        TAG_DELETE => Ok(Directive::Delete(FileDelete {
            path: RelPath::parse(required_attr(tag, "path")?)?,
        })),
        TAG_ADD_DEPENDENCY => {
            let packages: Vec<String> = required_attr(tag, "packages")?
                .split_whitespace()
                .map(str::to_string)
                .collect();
            Ok(Directive::AddDependency(AddDependency { packages }))
        }
        TAG_EXECUTE_SQL => {
            let content = strip_code_fences(tag.content.trim());
            if content.trim().is_empty() {
                return Err("<execute-sql> has no SQL".to_string());
            }
            Ok(Directive::ExecuteSql(ExecuteSql {
                content,
                description: optional_attr(tag, "description"),
            }))
        }
        TAG_COMMAND => {
            let kind = required_attr(tag, "type")?.parse::<CommandKind>()?;
            Ok(Directive::Command(UiCommand { kind }))
        }
        other => Err(format!("unsupported tag <{}>", other)),
    }
}

/// Drop one opening fence line and one closing fence line, if present.
fn strip_code_fences(content: &str) -> String {
    let mut lines: Vec<&str> = content.split('\n').collect();
    if lines
        .first()
        .is_some_and(|line| line.trim_start().starts_with("```"))
    {
        lines.remove(0);
    }
    let mut stripped_tail = false;
    if lines
        .last()
        .is_some_and(|line| line.trim().starts_with("```"))
    {
        lines.pop();
        stripped_tail = true;
    }
    let joined = lines.join("\n");
    if stripped_tail {
        joined.trim_end_matches('\r').to_string()
    } else {
        joined
    }
}
