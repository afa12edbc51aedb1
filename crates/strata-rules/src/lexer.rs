//! Tokenizer for rule expressions.

use crate::{
  Error,
  Result,
  ast::{CmpOp, Operator},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
  /// Field path, macro (`@request.auth.id`) or keyword (`true`, `null`).
  Ident(String),
  Str(String),
  Number(String),
  Op(Operator),
  And,
  Or,
  LParen,
  RParen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
  pub token: Token,
  pub pos:   usize,
}

fn is_ident_start(c: char) -> bool { c.is_alphabetic() || c == '_' || c == '@' }

fn is_ident_char(c: char) -> bool {
  c.is_alphanumeric() || matches!(c, '_' | '.' | ':' | '@')
}

pub fn tokenize(input: &str) -> Result<Vec<Spanned>> {
  let chars: Vec<(usize, char)> = input.char_indices().collect();
  let mut tokens = Vec::new();
  let mut i = 0;

  while i < chars.len() {
    let (pos, c) = chars[i];

    if c.is_whitespace() {
      i += 1;
      continue;
    }

    // `// comment` runs to the end of the line.
    if c == '/' && chars.get(i + 1).is_some_and(|(_, n)| *n == '/') {
      while i < chars.len() && chars[i].1 != '\n' {
        i += 1;
      }
      continue;
    }

    match c {
      '(' => {
        tokens.push(Spanned { token: Token::LParen, pos });
        i += 1;
      }
      ')' => {
        tokens.push(Spanned { token: Token::RParen, pos });
        i += 1;
      }
      '&' | '|' => {
        if chars.get(i + 1).map(|(_, n)| *n) != Some(c) {
          return Err(Error::syntax(pos, format!("expected {c}{c}")));
        }
        let token = if c == '&' { Token::And } else { Token::Or };
        tokens.push(Spanned { token, pos });
        i += 2;
      }
      '\'' | '"' => {
        let (value, next) = read_string(&chars, i)?;
        tokens.push(Spanned { token: Token::Str(value), pos });
        i = next;
      }
      '=' | '!' | '>' | '<' | '~' | '?' => {
        let (op, next) = read_operator(&chars, i)?;
        tokens.push(Spanned { token: Token::Op(op), pos });
        i = next;
      }
      c if c.is_ascii_digit()
        || (c == '-' && chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit())) =>
      {
        let start = i;
        i += 1;
        while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
          i += 1;
        }
        let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
        if text.parse::<f64>().is_err() {
          return Err(Error::syntax(pos, format!("invalid number {text:?}")));
        }
        tokens.push(Spanned { token: Token::Number(text), pos });
      }
      c if is_ident_start(c) => {
        let start = i;
        while i < chars.len() && is_ident_char(chars[i].1) {
          i += 1;
        }
        let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
        tokens.push(Spanned { token: Token::Ident(text), pos });
      }
      other => return Err(Error::syntax(pos, format!("unexpected character {other:?}"))),
    }
  }

  Ok(tokens)
}

fn read_string(chars: &[(usize, char)], start: usize) -> Result<(String, usize)> {
  let quote = chars[start].1;
  let mut out = String::new();
  let mut i = start + 1;
  while i < chars.len() {
    let c = chars[i].1;
    if c == '\\' && chars.get(i + 1).is_some_and(|(_, n)| *n == quote || *n == '\\') {
      out.push(chars[i + 1].1);
      i += 2;
      continue;
    }
    if c == quote {
      return Ok((out, i + 1));
    }
    out.push(c);
    i += 1;
  }
  Err(Error::syntax(chars[start].0, "unterminated string"))
}

fn read_operator(chars: &[(usize, char)], start: usize) -> Result<(Operator, usize)> {
  let pos = chars[start].0;
  let mut i = start;
  let any = chars[i].1 == '?';
  if any {
    i += 1;
  }
  let first = chars.get(i).map(|(_, c)| *c);
  let second = chars.get(i + 1).map(|(_, c)| *c);
  let (op, len) = match (first, second) {
    (Some('!'), Some('=')) => (CmpOp::Neq, 2),
    (Some('!'), Some('~')) => (CmpOp::NotLike, 2),
    (Some('>'), Some('=')) => (CmpOp::Gte, 2),
    (Some('<'), Some('=')) => (CmpOp::Lte, 2),
    (Some('='), _) => (CmpOp::Eq, 1),
    (Some('>'), _) => (CmpOp::Gt, 1),
    (Some('<'), _) => (CmpOp::Lt, 1),
    (Some('~'), _) => (CmpOp::Like, 1),
    _ => return Err(Error::syntax(pos, "invalid operator")),
  };
  Ok((Operator { op, any }, i + len))
}
