use crate::script::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Dot,
    Comma,
    Colon,
    Semicolon,
    Question,
    Assign,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    EqEq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    AndAnd,
    OrOr,
    Contains,
    Matches,
    Fn,
    Let,
    If,
    Else,
    For,
    In,
    While,
    Return,
    Schema,
    Identifier(String),
    Number(f64),
    String(String),
    True,
    False,
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

pub fn tokenize(input: &str) -> Result<Vec<Spanned>, ScriptError> {
    let mut chars = input.char_indices().peekable();
    let mut tokens = Vec::new();
    let mut line = 1usize;

    while let Some((idx, ch)) = chars.peek().copied() {
        if ch == '\n' {
            line += 1;
            chars.next();
            continue;
        }
        if ch.is_whitespace() {
            chars.next();
            continue;
        }

        let starts_comment = ch == '#'
            || (ch == '/' && input[idx + 1..].starts_with('/'));
        if starts_comment {
            while let Some((_, c)) = chars.peek().copied() {
                if c == '\n' {
                    break;
                }
                chars.next();
            }
            continue;
        }

        if ch.is_ascii_digit() {
            let start = idx;
            chars.next();
            while let Some((pos, c)) = chars.peek().copied() {
                let fraction = c == '.'
                    && input[pos + 1..]
                        .chars()
                        .next()
                        .is_some_and(|next| next.is_ascii_digit());
                if c.is_ascii_digit() || fraction {
                    chars.next();
                } else {
                    break;
                }
            }
            let end = chars.peek().map(|(i, _)| *i).unwrap_or(input.len());
            let text = &input[start..end];
            let number = text
                .parse::<f64>()
                .map_err(|err| ScriptError::parse(line, format!("invalid number '{text}': {err}")))?;
            tokens.push(Spanned {
                token: Token::Number(number),
                line,
            });
            continue;
        }

        if ch == '\'' || ch == '"' {
            let quote = ch;
            let start_line = line;
            chars.next();
            let mut value = String::new();
            let mut escaped = false;
            let mut terminated = false;

            for (_, c) in chars.by_ref() {
                if c == '\n' {
                    line += 1;
                }
                if escaped {
                    let translated = match c {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        other => other,
                    };
                    value.push(translated);
                    escaped = false;
                    continue;
                }
                if c == '\\' {
                    escaped = true;
                    continue;
                }
                if c == quote {
                    terminated = true;
                    break;
                }
                value.push(c);
            }

            if !terminated {
                return Err(ScriptError::parse(start_line, "unterminated string literal"));
            }
            tokens.push(Spanned {
                token: Token::String(value),
                line: start_line,
            });
            continue;
        }

        if ch.is_ascii_alphabetic() || ch == '_' {
            let start = idx;
            chars.next();
            while let Some((_, c)) = chars.peek().copied() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    chars.next();
                } else {
                    break;
                }
            }
            let end = chars.peek().map(|(i, _)| *i).unwrap_or(input.len());
            let token = match &input[start..end] {
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                "contains" => Token::Contains,
                "matches" => Token::Matches,
                "fn" => Token::Fn,
                "let" => Token::Let,
                "if" => Token::If,
                "else" => Token::Else,
                "for" => Token::For,
                "in" => Token::In,
                "while" => Token::While,
                "return" => Token::Return,
                "schema" => Token::Schema,
                ident => Token::Identifier(ident.to_owned()),
            };
            tokens.push(Spanned { token, line });
            continue;
        }

        chars.next();
        let mut followed_by = |expected: char| {
            if matches!(chars.peek(), Some((_, c)) if *c == expected) {
                chars.next();
                true
            } else {
                false
            }
        };

        let token = match ch {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '.' => Token::Dot,
            ',' => Token::Comma,
            ':' => Token::Colon,
            ';' => Token::Semicolon,
            '?' => Token::Question,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '!' if followed_by('=') => Token::NotEq,
            '!' => Token::Not,
            '=' if followed_by('=') => Token::EqEq,
            '=' => Token::Assign,
            '>' if followed_by('=') => Token::Gte,
            '>' => Token::Gt,
            '<' if followed_by('=') => Token::Lte,
            '<' => Token::Lt,
            '&' if followed_by('&') => Token::AndAnd,
            '|' if followed_by('|') => Token::OrOr,
            '&' => return Err(ScriptError::parse(line, "unexpected '&'; use '&&'")),
            '|' => return Err(ScriptError::parse(line, "unexpected '|'; use '||'")),
            other => {
                return Err(ScriptError::parse(
                    line,
                    format!("unexpected character '{other}'"),
                ))
            }
        };
        tokens.push(Spanned { token, line });
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input)
            .expect("tokenize")
            .into_iter()
            .map(|spanned| spanned.token)
            .collect()
    }

    #[test]
    fn skips_both_comment_styles() {
        let tokens = kinds("let x = 1 # trailing\n// whole line\nx");
        assert_eq!(
            tokens,
            [
                Token::Let,
                Token::Identifier("x".to_owned()),
                Token::Assign,
                Token::Number(1.0),
                Token::Identifier("x".to_owned()),
            ]
        );
    }

    #[test]
    fn tracks_line_numbers() {
        let tokens = tokenize("a\n\n'two\nlines'\nb").expect("tokenize");
        let lines: Vec<usize> = tokens.iter().map(|spanned| spanned.line).collect();
        assert_eq!(lines, [1, 3, 5]);
    }

    #[test]
    fn number_followed_by_method_call() {
        assert_eq!(
            kinds("1.5 2.abs"),
            [
                Token::Number(1.5),
                Token::Number(2.0),
                Token::Dot,
                Token::Identifier("abs".to_owned()),
            ]
        );
    }

    #[test]
    fn reports_unterminated_string() {
        let err = tokenize("let s = \"open").expect_err("unterminated");
        assert!(matches!(err, ScriptError::Parse { line: 1, .. }));
    }
}
