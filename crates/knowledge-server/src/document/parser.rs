use pulldown_cmark::{CodeBlockKind, Event, Options, Parser as MdParser, Tag, TagEnd};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

const FRONTMATTER_DELIMITER: &str = "---";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("invalid frontmatter YAML at line {line}, column {column}: {message}")]
    FrontmatterYaml {
        message: String,
        line: usize,
        column: usize,
    },
    #[error("frontmatter must be a mapping, got {0}")]
    FrontmatterNotMapping(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderInfo {
    /// 1..=6
    pub level: usize,
    pub text: String,
    /// 1-based line in the original file.
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub url: String,
    pub text: String,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeBlockInfo {
    pub language: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub frontmatter: Option<JsonMap<String, JsonValue>>,
    pub body: String,
    pub headers: Vec<HeaderInfo>,
    pub links: Vec<LinkInfo>,
    pub code_blocks: Vec<CodeBlockInfo>,
    /// Lines consumed by the frontmatter block including both delimiters;
    /// zero when no frontmatter was present.
    pub frontmatter_lines: usize,
}

impl ParsedDocument {
    /// Title the document itself declares: frontmatter `title`, else the
    /// first H1. `None` when neither is present.
    pub fn explicit_title(&self) -> Option<String> {
        if let Some(fm) = &self.frontmatter {
            if let Some(JsonValue::String(title)) = fm.get("title") {
                if !title.trim().is_empty() {
                    return Some(title.trim().to_string());
                }
            }
        }

        self.headers
            .iter()
            .find(|h| h.level == 1 && !h.text.trim().is_empty())
            .map(|h| h.text.trim().to_string())
    }

    /// Frontmatter `title` -> first H1 -> file stem.
    pub fn resolve_title(&self, file_path: &str) -> String {
        if let Some(title) = self.explicit_title() {
            return title;
        }

        std::path::Path::new(file_path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| file_path.to_string())
    }

    pub fn doc_type(&self) -> Option<String> {
        self.frontmatter.as_ref().and_then(|fm| {
            fm.get("doc_type")
                .and_then(JsonValue::as_str)
                .map(|s| s.to_string())
        })
    }

    /// Headers re-based to 1-based body coordinates for the chunker.
    pub fn body_headers(&self) -> Vec<HeaderInfo> {
        self.headers
            .iter()
            .map(|h| HeaderInfo {
                level: h.level,
                text: h.text.clone(),
                line: h.line.saturating_sub(self.frontmatter_lines),
            })
            .collect()
    }
}

pub struct DocumentParser;

impl DocumentParser {
    /// Split frontmatter/body and extract the structural elements the
    /// indexer and link graph need. Input must already be valid UTF-8.
    pub fn parse(content: &str) -> Result<ParsedDocument, ParseError> {
        let (frontmatter, body, frontmatter_lines) = Self::split_frontmatter(content)?;

        let (headers, links, code_blocks) = Self::extract_structure(&body, frontmatter_lines);

        debug!(
            headers = headers.len(),
            links = links.len(),
            code_blocks = code_blocks.len(),
            "Parsed markdown document"
        );

        Ok(ParsedDocument {
            frontmatter,
            body,
            headers,
            links,
            code_blocks,
            frontmatter_lines,
        })
    }

    /// Inverse of `parse` for the frontmatter/body split: a parse of the
    /// rendered output yields the same map and body.
    pub fn render(frontmatter: &JsonMap<String, JsonValue>, body: &str) -> String {
        let yaml = serde_yaml::to_string(&JsonValue::Object(frontmatter.clone()))
            .unwrap_or_default();
        format!("{FRONTMATTER_DELIMITER}\n{yaml}{FRONTMATTER_DELIMITER}\n{body}")
    }

    #[allow(clippy::type_complexity)]
    fn split_frontmatter(
        content: &str,
    ) -> Result<(Option<JsonMap<String, JsonValue>>, String, usize), ParseError> {
        let mut lines = content.lines();
        if lines.next().map(str::trim_end) != Some(FRONTMATTER_DELIMITER) {
            return Ok((None, content.to_string(), 0));
        }

        // Find the closing delimiter; an unclosed block reverts to
        // "no frontmatter" with the full input as body.
        let mut yaml_lines: Vec<&str> = Vec::new();
        let mut closed_at: Option<usize> = None;
        for (idx, line) in content.lines().enumerate().skip(1) {
            if line.trim_end() == FRONTMATTER_DELIMITER {
                closed_at = Some(idx);
                break;
            }
            yaml_lines.push(line);
        }

        let Some(close_idx) = closed_at else {
            return Ok((None, content.to_string(), 0));
        };

        let yaml_text = yaml_lines.join("\n");
        let frontmatter = if yaml_text.trim().is_empty() {
            Some(JsonMap::new())
        } else {
            let value: serde_yaml::Value =
                serde_yaml::from_str(&yaml_text).map_err(|e| {
                    let location = e.location();
                    ParseError::FrontmatterYaml {
                        message: e.to_string(),
                        // +1 re-bases onto file coordinates past the opening fence.
                        line: location.as_ref().map(|l| l.line() + 1).unwrap_or(2),
                        column: location.as_ref().map(|l| l.column()).unwrap_or(1),
                    }
                })?;

            match yaml_to_json(value) {
                JsonValue::Object(map) => Some(map),
                other => {
                    return Err(ParseError::FrontmatterNotMapping(type_name(&other)));
                }
            }
        };

        let frontmatter_lines = close_idx + 1;
        let body = content
            .lines()
            .skip(frontmatter_lines)
            .collect::<Vec<_>>()
            .join("\n");

        Ok((frontmatter, body, frontmatter_lines))
    }

    fn extract_structure(
        body: &str,
        line_offset: usize,
    ) -> (Vec<HeaderInfo>, Vec<LinkInfo>, Vec<CodeBlockInfo>) {
        let line_starts = line_start_offsets(body);
        let line_of = |offset: usize| -> usize {
            line_starts.partition_point(|&start| start <= offset) + line_offset
        };

        let mut headers = Vec::new();
        let mut links = Vec::new();
        let mut code_blocks = Vec::new();

        let mut heading: Option<(usize, String, usize)> = None;
        let mut link: Option<(String, String, usize, usize)> = None;
        let mut code_block: Option<(Option<String>, String)> = None;

        let parser = MdParser::new_ext(body, Options::all());
        for (event, range) in parser.into_offset_iter() {
            match event {
                Event::Start(Tag::Heading { level, .. }) => {
                    heading = Some((level as usize, String::new(), line_of(range.start)));
                }
                Event::End(TagEnd::Heading(_)) => {
                    if let Some((level, text, line)) = heading.take() {
                        headers.push(HeaderInfo { level, text, line });
                    }
                }
                Event::Start(Tag::Link { dest_url, .. }) => {
                    link = Some((
                        dest_url.to_string(),
                        String::new(),
                        line_of(range.start),
                        line_of(range.end.saturating_sub(1).max(range.start)),
                    ));
                }
                Event::End(TagEnd::Link) => {
                    if let Some((url, text, start_line, end_line)) = link.take() {
                        if is_relative_link(&url) {
                            links.push(LinkInfo {
                                url,
                                text,
                                start_line,
                                end_line,
                            });
                        }
                    }
                }
                Event::Start(Tag::CodeBlock(kind)) => {
                    let language = match kind {
                        CodeBlockKind::Fenced(lang) if !lang.is_empty() => {
                            Some(lang.to_string())
                        }
                        _ => None,
                    };
                    code_block = Some((language, String::new()));
                }
                Event::End(TagEnd::CodeBlock) => {
                    if let Some((language, content)) = code_block.take() {
                        code_blocks.push(CodeBlockInfo { language, content });
                    }
                }
                Event::Text(text) | Event::Code(text) => {
                    if let Some((_, buf)) = code_block.as_mut() {
                        buf.push_str(&text);
                    } else if let Some((_, buf, _, _)) = link.as_mut() {
                        buf.push_str(&text);
                    } else if let Some((_, buf, _)) = heading.as_mut() {
                        buf.push_str(&text);
                    }
                }
                _ => {}
            }
        }

        (headers, links, code_blocks)
    }
}

fn is_relative_link(url: &str) -> bool {
    let lowered = url.to_ascii_lowercase();
    if lowered.starts_with("http://")
        || lowered.starts_with("https://")
        || lowered.starts_with("mailto:")
    {
        return false;
    }
    // Pure in-page anchors reference no other document.
    !url.starts_with('#') && !url.is_empty()
}

fn line_start_offsets(text: &str) -> Vec<usize> {
    let mut starts = vec![0usize];
    for (idx, byte) in text.bytes().enumerate() {
        if byte == b'\n' {
            starts.push(idx + 1);
        }
    }
    starts
}

fn yaml_to_json(value: serde_yaml::Value) -> JsonValue {
    match value {
        serde_yaml::Value::Null => JsonValue::Null,
        serde_yaml::Value::Bool(b) => JsonValue::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                JsonValue::from(i)
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            } else {
                JsonValue::Null
            }
        }
        serde_yaml::Value::String(s) => JsonValue::String(s),
        serde_yaml::Value::Sequence(seq) => {
            JsonValue::Array(seq.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let mut out = JsonMap::new();
            for (k, v) in map {
                let key = match k {
                    serde_yaml::Value::String(s) => s,
                    other => serde_yaml::to_string(&other)
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                };
                out.insert(key, yaml_to_json(v));
            }
            JsonValue::Object(out)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

fn type_name(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "sequence",
        JsonValue::Object(_) => "mapping",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_frontmatter_and_body() {
        let input = "---\ntitle: Hello\ndoc_type: doc\ntags:\n  - a\n  - b\n---\n# Hello\n\nworld";
        let parsed = DocumentParser::parse(input).expect("parse");

        let fm = parsed.frontmatter.expect("frontmatter");
        assert_eq!(fm.get("title"), Some(&json!("Hello")));
        assert_eq!(fm.get("doc_type"), Some(&json!("doc")));
        assert_eq!(fm.get("tags"), Some(&json!(["a", "b"])));
        assert_eq!(parsed.body, "# Hello\n\nworld");
        assert_eq!(parsed.frontmatter_lines, 7);
    }

    #[test]
    fn no_frontmatter_is_not_an_error() {
        let parsed = DocumentParser::parse("# Just a body\n").expect("parse");
        assert!(parsed.frontmatter.is_none());
        assert_eq!(parsed.body, "# Just a body\n");
        assert_eq!(parsed.frontmatter_lines, 0);
    }

    #[test]
    fn unclosed_frontmatter_reverts_to_body() {
        let input = "---\ntitle: Broken\n\n# Heading";
        let parsed = DocumentParser::parse(input).expect("parse");
        assert!(parsed.frontmatter.is_none());
        assert_eq!(parsed.body, input);
    }

    #[test]
    fn invalid_yaml_reports_location() {
        let input = "---\ntitle: [unclosed\n---\nbody";
        let err = DocumentParser::parse(input).expect_err("must fail");
        match err {
            ParseError::FrontmatterYaml { line, .. } => assert!(line >= 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn scalar_frontmatter_is_rejected() {
        let input = "---\njust a string\n---\nbody";
        let err = DocumentParser::parse(input).expect_err("must fail");
        assert!(matches!(err, ParseError::FrontmatterNotMapping(_)));
    }

    #[test]
    fn extracts_headers_with_lines() {
        let input = "---\ntitle: T\n---\n# One\n\ntext\n\n## Two\n";
        let parsed = DocumentParser::parse(input).expect("parse");
        assert_eq!(
            parsed.headers,
            vec![
                HeaderInfo {
                    level: 1,
                    text: "One".into(),
                    line: 4
                },
                HeaderInfo {
                    level: 2,
                    text: "Two".into(),
                    line: 8
                },
            ]
        );
        // Body coordinates shift by the frontmatter block.
        assert_eq!(parsed.body_headers()[0].line, 1);
    }

    #[test]
    fn extracts_relative_links_only() {
        let input = "See [guide](docs/guide.md) and [site](https://example.com)\n\
                     plus [mail](mailto:a@b.c) and [anchor](#local) and [up](../other.md).";
        let parsed = DocumentParser::parse(input).expect("parse");
        let urls: Vec<&str> = parsed.links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(urls, vec!["docs/guide.md", "../other.md"]);
        assert_eq!(parsed.links[0].text, "guide");
        assert_eq!(parsed.links[0].start_line, 1);
    }

    #[test]
    fn extracts_fenced_code_blocks() {
        let input = "intro\n\n```rust\nfn main() {}\n```\n\n```\nplain\n```\n";
        let parsed = DocumentParser::parse(input).expect("parse");
        assert_eq!(parsed.code_blocks.len(), 2);
        assert_eq!(parsed.code_blocks[0].language.as_deref(), Some("rust"));
        assert_eq!(parsed.code_blocks[0].content, "fn main() {}\n");
        assert_eq!(parsed.code_blocks[1].language, None);
    }

    #[test]
    fn title_resolution_order() {
        let with_fm = DocumentParser::parse("---\ntitle: From FM\n---\n# From H1\n").unwrap();
        assert_eq!(with_fm.resolve_title("docs/readme.md"), "From FM");

        let with_h1 = DocumentParser::parse("# From H1\n\ntext").unwrap();
        assert_eq!(with_h1.resolve_title("docs/readme.md"), "From H1");

        let bare = DocumentParser::parse("no headings here").unwrap();
        assert_eq!(bare.resolve_title("docs/setup-guide.md"), "setup-guide");
    }

    #[test]
    fn frontmatter_round_trip() {
        let mut fm = JsonMap::new();
        fm.insert("title".into(), json!("Round Trip"));
        fm.insert("doc_type".into(), json!("doc"));
        fm.insert("level".into(), json!(3));
        fm.insert("nested".into(), json!({"a": [1, 2], "b": true}));
        let body = "# Round Trip\n\nbody text";

        let rendered = DocumentParser::render(&fm, body);
        let parsed = DocumentParser::parse(&rendered).expect("parse");

        assert_eq!(parsed.frontmatter, Some(fm));
        assert_eq!(parsed.body, body);
    }
}
