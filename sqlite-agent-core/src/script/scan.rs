//! Locates the single `structured_tool(...)` expression in tool source
//! without parsing the rest of it.

use crate::error::{Error, Result};

const MARKER: &str = "structured_tool";
const MAX_TOOL_NAME: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDefinition {
    pub func: String,
    pub name: String,
    pub description: String,
    pub args_schema: String,
    /// 1-based line of the marker in the scanned text.
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Code,
    Literal,
    Comment,
}

/// Classifies every byte of `source` as code, string literal or comment.
fn classify(source: &str) -> Vec<Region> {
    let bytes = source.as_bytes();
    let mut regions = vec![Region::Code; bytes.len()];
    let mut index = 0;

    while index < bytes.len() {
        let start = index;
        match bytes[index] {
            b'#' => {
                index = line_end(bytes, index);
                regions[start..index].fill(Region::Comment);
            }
            b'/' if bytes.get(index + 1) == Some(&b'/') => {
                index = line_end(bytes, index);
                regions[start..index].fill(Region::Comment);
            }
            quote @ (b'"' | b'\'') => {
                index += 1;
                while index < bytes.len() {
                    match bytes[index] {
                        b'\\' => index += 2,
                        byte if byte == quote => {
                            index += 1;
                            break;
                        }
                        _ => index += 1,
                    }
                }
                index = index.min(bytes.len());
                regions[start..index].fill(Region::Literal);
            }
            _ => index += 1,
        }
    }
    regions
}

fn line_end(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|byte| *byte == b'\n')
        .map_or(bytes.len(), |offset| start + offset)
}

fn is_ident_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// Names function-calling endpoints accept: 1 to 64 of `[A-Za-z0-9_-]`.
fn is_tool_name(value: &str) -> bool {
    (1..=MAX_TOOL_NAME).contains(&value.len())
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-')
}

fn is_identifier(value: &str) -> bool {
    let mut bytes = value.bytes();
    bytes
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == b'_')
        && bytes.all(is_ident_byte)
}

/// Offsets of the opening paren of every `structured_tool(` call in code.
fn find_markers(source: &str, regions: &[Region]) -> Vec<(usize, usize)> {
    let bytes = source.as_bytes();
    let mut found = Vec::new();

    for (start, _) in source.match_indices(MARKER) {
        let end = start + MARKER.len();
        if regions[start] != Region::Code {
            continue;
        }
        let preceded = start > 0 && (is_ident_byte(bytes[start - 1]) || bytes[start - 1] == b'.');
        let followed = bytes.get(end).is_some_and(|byte| is_ident_byte(*byte));
        if preceded || followed {
            continue;
        }

        let paren = (end..bytes.len()).find(|&index| !bytes[index].is_ascii_whitespace());
        if let Some(paren) = paren.filter(|&index| bytes[index] == b'(' && regions[index] == Region::Code) {
            found.push((start, paren));
        }
    }
    found
}

fn closing_paren(bytes: &[u8], regions: &[Region], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for index in open..bytes.len() {
        if regions[index] != Region::Code {
            continue;
        }
        match bytes[index] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return (bytes[index] == b')').then_some(index);
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits `start..end` at top-level commas, yielding trimmed byte ranges.
fn split_arguments(source: &str, regions: &[Region], start: usize, end: usize) -> Vec<(usize, usize)> {
    let bytes = source.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut part_start = start;

    for index in start..end {
        if regions[index] != Region::Code {
            continue;
        }
        match bytes[index] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                parts.push((part_start, index));
                part_start = index + 1;
            }
            _ => {}
        }
    }
    parts.push((part_start, end));

    parts
        .into_iter()
        .map(|(from, to)| trim_code(source, regions, from, to))
        .filter(|(from, to)| from < to)
        .collect()
}

/// Trims whitespace and comments from both ends of a range.
fn trim_code(source: &str, regions: &[Region], mut from: usize, mut to: usize) -> (usize, usize) {
    let bytes = source.as_bytes();
    let skippable = |index: usize| {
        regions[index] == Region::Comment
            || (regions[index] == Region::Code && bytes[index].is_ascii_whitespace())
    };

    while from < to && skippable(from) {
        from += 1;
    }
    while to > from && skippable(to - 1) {
        to -= 1;
    }
    (from, to)
}

/// Decodes a complete single string literal, or None if `text` is anything else.
fn string_literal(text: &str) -> Option<String> {
    let mut chars = text.chars();
    let quote = chars.next().filter(|c| *c == '"' || *c == '\'')?;
    let mut value = String::new();
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if escaped {
            value.push(match c {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            c if c == quote => {
                return chars.as_str().trim().is_empty().then_some(value);
            }
            c => value.push(c),
        }
    }
    None
}

pub fn scan_tool_definition(source: &str, max_bytes: usize) -> Result<ToolDefinition> {
    if source.len() > max_bytes {
        return Err(Error::MalformedTool(format!(
            "tool source is {} bytes; the limit is {max_bytes}",
            source.len()
        )));
    }

    let regions = classify(source);
    let markers = find_markers(source, &regions);
    let (marker, open) = match markers.as_slice() {
        [] => {
            return Err(Error::MalformedTool(format!(
                "no {MARKER}(...) expression found"
            )))
        }
        [single] => *single,
        many => {
            return Err(Error::MalformedTool(format!(
                "found {} {MARKER}(...) expressions; exactly one is required",
                many.len()
            )))
        }
    };

    let line = source[..marker].matches('\n').count() + 1;
    let close = closing_paren(source.as_bytes(), &regions, open).ok_or_else(|| {
        Error::MalformedTool(format!("unbalanced {MARKER}(...) expression at line {line}"))
    })?;

    let mut func = None;
    let mut name = None;
    let mut description = None;
    let mut args_schema = None;

    for (from, to) in split_arguments(source, &regions, open + 1, close) {
        let argument = &source[from..to];
        let split = (from..to).find(|&index| {
            regions[index] == Region::Code
                && source.as_bytes()[index] == b'='
                && source.as_bytes().get(index + 1) != Some(&b'=')
        });
        let Some(equals) = split else {
            return Err(Error::MalformedTool(format!(
                "{MARKER} arguments must be written as key = value, got '{argument}'"
            )));
        };

        let key = source[from..equals].trim();
        let value = source[equals + 1..to].trim();
        let slot = match key {
            "func" => &mut func,
            "name" => &mut name,
            "description" => &mut description,
            "args_schema" => &mut args_schema,
            _ => continue,
        };
        if slot.is_some() {
            return Err(Error::MalformedTool(format!(
                "'{key}' is given more than once"
            )));
        }

        let parsed = match key {
            "func" | "args_schema" => is_identifier(value).then(|| value.to_owned()),
            _ => string_literal(value),
        };
        let Some(parsed) = parsed else {
            let expected = if matches!(key, "func" | "args_schema") {
                "an identifier"
            } else {
                "a string literal"
            };
            return Err(Error::MalformedTool(format!(
                "'{key}' must be {expected}, got '{value}'"
            )));
        };
        *slot = Some(parsed);
    }

    let missing = |field: &str| Error::MalformedTool(format!("{MARKER}(...) is missing '{field}'"));
    let name = name.ok_or_else(|| missing("name"))?;
    if !is_tool_name(&name) {
        return Err(Error::MalformedTool(format!(
            "'name' must be 1 to {MAX_TOOL_NAME} letters, digits, '_' or '-', got '{name}'"
        )));
    }
    Ok(ToolDefinition {
        func: func.ok_or_else(|| missing("func"))?,
        name,
        description: description.ok_or_else(|| missing("description"))?,
        args_schema: args_schema.ok_or_else(|| missing("args_schema"))?,
        line,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 64 * 1024;

    fn scan(source: &str) -> Result<ToolDefinition> {
        scan_tool_definition(source, LIMIT)
    }

    #[test]
    fn finds_multiline_definition_among_code() {
        let source = r#"
# structured_tool( in a comment is ignored
let note = "structured_tool(func = x)"
fn helper(text) { return text }

structured_tool(
    func = helper,
    name = "EchoTool",   // trailing comment, with a comma
    description = 'Echoes (the) text, verbatim: "as is"',
    args_schema = EchoInput,
    return_direct = true,
)
"#;
        let definition = scan(source).expect("scan");
        assert_eq!(definition.func, "helper");
        assert_eq!(definition.name, "EchoTool");
        assert_eq!(definition.description, "Echoes (the) text, verbatim: \"as is\"");
        assert_eq!(definition.args_schema, "EchoInput");
        assert_eq!(definition.line, 6);
    }

    #[test]
    fn rejects_zero_or_many_expressions() {
        assert!(matches!(scan("fn f() { }"), Err(Error::MalformedTool(_))));

        let twice = "structured_tool(func = a, name = \"A\", description = \"a\", args_schema = S)\n\
                     structured_tool(func = b, name = \"B\", description = \"b\", args_schema = S)";
        let Err(Error::MalformedTool(message)) = scan(twice) else {
            panic!("expected malformed");
        };
        assert!(message.contains("found 2"));
    }

    #[test]
    fn rejects_unbalanced_expression() {
        let source = "structured_tool(func = a, name = \"A\", description = \"a\", args_schema = S";
        assert!(matches!(scan(source), Err(Error::MalformedTool(_))));
    }

    #[test]
    fn rejects_missing_or_ill_typed_fields() {
        let missing = "structured_tool(func = a, name = \"A\", args_schema = S)";
        let Err(Error::MalformedTool(message)) = scan(missing) else {
            panic!("expected malformed");
        };
        assert!(message.contains("description"));

        let computed_name = "structured_tool(func = a, name = \"A\" + x, description = \"d\", args_schema = S)";
        assert!(matches!(scan(computed_name), Err(Error::MalformedTool(_))));

        let quoted_func = "structured_tool(func = \"a\", name = \"A\", description = \"d\", args_schema = S)";
        assert!(matches!(scan(quoted_func), Err(Error::MalformedTool(_))));
    }

    #[test]
    fn rejects_names_models_cannot_call() {
        let long = "T".repeat(65);
        for name in ["Echo Tool", "", "Tool.v2", long.as_str()] {
            let source = format!(
                "structured_tool(func = a, name = \"{name}\", description = \"d\", args_schema = S)"
            );
            let Err(Error::MalformedTool(message)) = scan(&source) else {
                panic!("expected '{name}' to be rejected");
            };
            assert!(message.contains("'name' must be"), "{message}");
        }

        let source = "structured_tool(func = a, name = \"fetch-orders_2\", description = \"d\", args_schema = S)";
        assert_eq!(scan(source).expect("scan").name, "fetch-orders_2");
    }

    #[test]
    fn ignores_lookalike_identifiers() {
        let source = "my_structured_tool(1)\nstructured_tool(func = a, name = \"A\", description = \"d\", args_schema = S)";
        assert_eq!(scan(source).expect("scan").name, "A");
    }

    #[test]
    fn rejects_oversized_source() {
        let source = "#".repeat(LIMIT + 1);
        assert!(matches!(scan(&source), Err(Error::MalformedTool(_))));
    }
}
