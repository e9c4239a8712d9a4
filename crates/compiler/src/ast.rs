//! Abstract syntax tree
//!
//! Nodes are allocated in a `bumpalo` arena owned by the caller and wired
//! together with `&'a` references, so the whole tree is dropped in one
//! shot when compilation finishes. Strings are arena slices too.
//!
//! The parser already desugars the forms that have no runtime
//! counterpart: `unless` arrives as an inverted [`Expr::If`], `until` as a
//! negated [`Expr::While`], `for` as a pre-declared variable plus an
//! `each` call whose block writes through the closure, `&:sym` as a block
//! literal, and symbol-key hash shorthand as regular pairs.

/// A node plus the source line it started on.
#[derive(Debug)]
pub struct Node<'a> {
    pub expr: Expr<'a>,
    pub line: u32,
}

pub type P<'a> = &'a Node<'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    CaseEq,
    Cmp,
    Lt,
    Le,
    Gt,
    Ge,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    /// `&&` / `and` — short-circuit, compiled to jumps.
    And,
    /// `||` / `or`.
    Or,
}

impl BinOp {
    /// The method name an object receives when the operands are not
    /// handled by a VM fast path.
    pub fn method_name(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::CaseEq => "===",
            BinOp::Cmp => "<=>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// One piece of a string literal.
#[derive(Debug)]
pub enum StrPart<'a> {
    Lit(&'a str),
    Interp(P<'a>),
}

/// One argument at a call site.
#[derive(Debug)]
pub enum Arg<'a> {
    Pos(P<'a>),
    /// `*expr` — expanded in place.
    Splat(P<'a>),
    /// `name: expr`.
    Kw(&'a str, P<'a>),
    /// `&expr` — pass as the call's block.
    BlockPass(P<'a>),
}

/// A block literal attached to a call.
#[derive(Debug)]
pub struct Block<'a> {
    pub params: &'a [&'a str],
    pub rest: Option<&'a str>,
    pub body: &'a [P<'a>],
    pub line: u32,
}

/// Formal parameters of a `def`.
#[derive(Debug, Default)]
pub struct Params<'a> {
    pub required: &'a [&'a str],
    pub optional: &'a [(&'a str, P<'a>)],
    pub rest: Option<&'a str>,
    pub kw: &'a [(&'a str, Option<P<'a>>)],
    pub block: Option<&'a str>,
}

#[derive(Debug)]
pub struct RescueClause<'a> {
    /// Filter class expressions; empty means bare rescue (StandardError).
    pub classes: &'a [P<'a>],
    pub var: Option<&'a str>,
    pub body: &'a [P<'a>],
}

#[derive(Debug)]
pub struct WhenClause<'a> {
    pub values: &'a [P<'a>],
    pub body: &'a [P<'a>],
}

#[derive(Debug)]
pub enum Expr<'a> {
    Nil,
    True,
    False,
    SelfLit,
    Int(i64),
    Float(f64),
    Str(&'a [StrPart<'a>]),
    Sym(&'a str),
    Array(&'a [P<'a>]),
    Hash(&'a [(P<'a>, P<'a>)]),
    Range {
        lo: P<'a>,
        hi: P<'a>,
        exclusive: bool,
    },

    /// Bare lowercase name: local, global, or zero-arg self call —
    /// resolved at compile/run time.
    Ident(&'a str),
    ConstName(&'a str),
    Ivar(&'a str),
    Cvar(&'a str),

    Assign {
        target: P<'a>,
        value: P<'a>,
    },
    /// `x op= v`, including `||=` / `&&=` via `BinOp::Or` / `BinOp::And`.
    OpAssign {
        target: P<'a>,
        op: BinOp,
        value: P<'a>,
    },
    MultiAssign {
        targets: &'a [P<'a>],
        /// Index into `targets` of a `*splat` target.
        splat: Option<usize>,
        value: P<'a>,
    },

    BinOp {
        op: BinOp,
        lhs: P<'a>,
        rhs: P<'a>,
    },
    UnOp {
        op: UnOp,
        operand: P<'a>,
    },

    Call {
        recv: Option<P<'a>>,
        name: &'a str,
        args: &'a [Arg<'a>],
        block: Option<&'a Block<'a>>,
        safe: bool,
    },
    Index {
        recv: P<'a>,
        args: &'a [P<'a>],
        safe: bool,
    },
    Super {
        /// None: bare `super`, forwards the current method's parameters.
        args: Option<&'a [Arg<'a>]>,
        block: Option<&'a Block<'a>>,
    },
    Yield {
        args: &'a [P<'a>],
    },

    If {
        cond: P<'a>,
        then_body: &'a [P<'a>],
        else_body: &'a [P<'a>],
    },
    While {
        cond: P<'a>,
        body: &'a [P<'a>],
    },
    /// `loop do … end`: infinite, left by `break`.
    Loop {
        body: &'a [P<'a>],
    },
    Case {
        subject: Option<P<'a>>,
        whens: &'a [WhenClause<'a>],
        else_body: &'a [P<'a>],
    },
    Begin {
        body: &'a [P<'a>],
        rescues: &'a [RescueClause<'a>],
        ensure_body: Option<&'a [P<'a>]>,
    },

    Def {
        name: &'a str,
        /// `def self.name`.
        singleton: bool,
        params: &'a Params<'a>,
        body: &'a [P<'a>],
    },
    ClassDef {
        name: &'a str,
        superclass: Option<P<'a>>,
        body: &'a [P<'a>],
    },
    ModuleDef {
        name: &'a str,
        body: &'a [P<'a>],
    },

    Return(Option<P<'a>>),
    Break(Option<P<'a>>),
    Next(Option<P<'a>>),
    Redo,
    Retry,

    /// Statement sequence evaluating to its last expression (used by
    /// desugarings that need to splice several statements into one slot).
    Seq(&'a [P<'a>]),
}
