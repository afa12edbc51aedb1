//! Immutable expression tree produced by the parser.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
  Eq,
  Neq,
  Gt,
  Gte,
  Lt,
  Lte,
  Like,
  NotLike,
}

impl CmpOp {
  pub fn negated(self) -> Self {
    match self {
      Self::Eq => Self::Neq,
      Self::Neq => Self::Eq,
      Self::Gt => Self::Lte,
      Self::Gte => Self::Lt,
      Self::Lt => Self::Gte,
      Self::Lte => Self::Gt,
      Self::Like => Self::NotLike,
      Self::NotLike => Self::Like,
    }
  }
}

/// A comparison operator; `any` is set for the `?`-prefixed forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operator {
  pub op:  CmpOp,
  pub any: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
  /// Field path or macro, possibly with a `:modifier` suffix.
  Ident(String),
  Str(String),
  Number(String),
  Bool(bool),
  Null,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  Compare { left: Operand, op: Operator, right: Operand },
  And(Box<Expr>, Box<Expr>),
  Or(Box<Expr>, Box<Expr>),
}
