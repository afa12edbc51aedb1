//! Recursive-descent parser: `||` binds loosest, then `&&`, then comparison.

use crate::{
  Error,
  Result,
  ast::{Expr, Operand},
  lexer::{Spanned, Token, tokenize},
};

/// Deepest allowed parenthesis nesting.
pub const MAX_NESTING: usize = 32;

/// Most comparisons a single expression may contain. `&&`/`||` chains build
/// one tree level per comparison, so this also bounds the tree depth.
pub const MAX_COMPARISONS: usize = 200;

pub fn parse(input: &str) -> Result<Expr> {
  let tokens = tokenize(input)?;
  if tokens.is_empty() {
    return Err(Error::syntax(0, "empty expression"));
  }
  let mut parser = Parser { tokens, pos: 0, end: input.len(), depth: 0, comparisons: 0 };
  let expr = parser.or_expr()?;
  if let Some(extra) = parser.peek() {
    return Err(Error::syntax(extra.pos, "unexpected trailing token"));
  }
  Ok(expr)
}

struct Parser {
  tokens:      Vec<Spanned>,
  pos:         usize,
  end:         usize,
  depth:       usize,
  comparisons: usize,
}

impl Parser {
  fn peek(&self) -> Option<&Spanned> { self.tokens.get(self.pos) }

  fn next(&mut self) -> Option<Spanned> {
    let t = self.tokens.get(self.pos).cloned();
    self.pos += 1;
    t
  }

  fn here(&self) -> usize { self.peek().map_or(self.end, |t| t.pos) }

  fn or_expr(&mut self) -> Result<Expr> {
    let mut left = self.and_expr()?;
    while self.peek().is_some_and(|t| t.token == Token::Or) {
      self.pos += 1;
      let right = self.and_expr()?;
      left = Expr::Or(Box::new(left), Box::new(right));
    }
    Ok(left)
  }

  fn and_expr(&mut self) -> Result<Expr> {
    let mut left = self.primary()?;
    while self.peek().is_some_and(|t| t.token == Token::And) {
      self.pos += 1;
      let right = self.primary()?;
      left = Expr::And(Box::new(left), Box::new(right));
    }
    Ok(left)
  }

  fn primary(&mut self) -> Result<Expr> {
    if self.peek().is_some_and(|t| t.token == Token::LParen) {
      let open = self.here();
      self.pos += 1;
      if self.peek().is_some_and(|t| t.token == Token::RParen) {
        return Err(Error::syntax(open, "empty group"));
      }
      if self.depth >= MAX_NESTING {
        return Err(Error::syntax(open, "expression too deeply nested"));
      }
      self.depth += 1;
      let inner = self.or_expr()?;
      self.depth -= 1;
      match self.next() {
        Some(Spanned { token: Token::RParen, .. }) => Ok(inner),
        _ => Err(Error::syntax(open, "unbalanced parenthesis")),
      }
    } else {
      self.comparison()
    }
  }

  fn comparison(&mut self) -> Result<Expr> {
    let at = self.here();
    self.comparisons += 1;
    if self.comparisons > MAX_COMPARISONS {
      return Err(Error::syntax(at, "too many conditions in expression"));
    }
    let left = self.operand()?;
    let at = self.here();
    let op = match self.next() {
      Some(Spanned { token: Token::Op(op), .. }) => op,
      _ => return Err(Error::syntax(at, "expected comparison operator")),
    };
    let right = self.operand()?;
    Ok(Expr::Compare { left, op, right })
  }

  fn operand(&mut self) -> Result<Operand> {
    let at = self.here();
    match self.next().map(|t| t.token) {
      Some(Token::Str(s)) => Ok(Operand::Str(s)),
      Some(Token::Number(n)) => Ok(Operand::Number(n)),
      Some(Token::Ident(id)) => Ok(match id.as_str() {
        "true" => Operand::Bool(true),
        "false" => Operand::Bool(false),
        "null" => Operand::Null,
        _ => Operand::Ident(id),
      }),
      _ => Err(Error::syntax(at, "expected operand")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ast::{CmpOp, Operator};

  fn cmp(left: &str, right: Operand) -> Expr {
    Expr::Compare {
      left: Operand::Ident(left.into()),
      op: Operator { op: CmpOp::Eq, any: false },
      right,
    }
  }

  #[test]
  fn and_binds_tighter_than_or() {
    let expr = parse("a = 1 || b = 2 && c = 3").unwrap();
    assert_eq!(
      expr,
      Expr::Or(
        Box::new(cmp("a", Operand::Number("1".into()))),
        Box::new(Expr::And(
          Box::new(cmp("b", Operand::Number("2".into()))),
          Box::new(cmp("c", Operand::Number("3".into()))),
        )),
      )
    );
  }

  #[test]
  fn parentheses_override_precedence() {
    let expr = parse("(a = 1 || b = 2) && c = null").unwrap();
    let Expr::And(left, right) = expr else { panic!("expected and") };
    assert!(matches!(*left, Expr::Or(..)));
    assert_eq!(*right, cmp("c", Operand::Null));
  }

  #[test]
  fn nesting_is_bounded() {
    let ok = format!("{}a = 1{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
    assert!(parse(&ok).is_ok());

    let deep = format!("{}a = 1{}", "(".repeat(4000), ")".repeat(4000));
    let err = parse(&deep).unwrap_err();
    assert!(err.to_string().contains("too deeply nested"), "{err}");
  }

  #[test]
  fn long_chains_are_bounded() {
    let ok = vec!["a = 1"; MAX_COMPARISONS].join(" && ");
    assert!(parse(&ok).is_ok());

    let long = vec!["a = 1"; 20_000].join(" || ");
    let err = parse(&long).unwrap_err();
    assert!(err.to_string().contains("too many conditions"), "{err}");
  }

  #[test]
  fn rejects_malformed_input() {
    for bad in ["", "a", "a =", "(a = 1", "a = 1)", "()", "a = 1 b = 2", "= 1"] {
      assert!(parse(bad).is_err(), "{bad:?} should fail");
    }
  }
}
