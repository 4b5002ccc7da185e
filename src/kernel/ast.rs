//! The typed kernel AST the front end hands to the execution core.
//!
//! Expressions and statements are sealed enums walked by match — there is no
//! open method table and no runtime type registration. The front end (or a
//! test) builds a [`KernelDef`] with the constructors here; the core type
//! checks it, phase-analyzes it, and compiles it into an executable.
//!
//! Field references always carry their owning relation
//! ([`FieldRef`]), because field ids are scoped to a relation.

use crate::ids::{FieldId, GlobalId, RelationId};
use crate::reduce::ReduceOp;
use crate::relation::Field;
use crate::store::Global;
use crate::types::{ScalarKind, Value};

/// A (relation, field) pair naming one column unambiguously.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub relation: RelationId,
    pub field: FieldId,
}

impl From<&Field> for FieldRef {
    fn from(f: &Field) -> Self {
        FieldRef { relation: f.relation_id(), field: f.id() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// How a field access names its row.
#[derive(Clone, Debug)]
pub enum Key {
    /// The row the kernel is currently mapped over.
    Centered,
    /// A grid displacement from the centered cell; wraps on periodic axes.
    Offset(Vec<i64>),
    /// A key value computed by an expression (e.g. read from a key field or
    /// bound by a query loop).
    Expr(Box<Expr>),
}

#[derive(Clone, Debug)]
pub enum Expr {
    Const(Value),
    /// A `let`- or query-bound name.
    Local(String),
    /// The linear id of the centered row, as `u64`.
    RowIndex,
    ReadGlobal(GlobalId),
    ReadField { field: FieldRef, key: Key },
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Select { cond: Box<Expr>, then_e: Box<Expr>, else_e: Box<Expr> },
    /// Construct a vector from scalar lanes.
    VecCons(Vec<Expr>),
    /// Extract one lane of a vector.
    Index { base: Box<Expr>, lane: usize },
    /// Explicit numeric conversion (both widening and narrowing).
    Cast(ScalarKind, Box<Expr>),
    /// True if the centered cell displaced by the offset stays on the grid
    /// (periodic axes always pass).
    InBounds(Vec<i64>),
}

#[derive(Clone, Debug)]
pub enum Stmt {
    Let { name: String, value: Expr },
    /// Write the centered row of a field of the launch relation.
    Assign { field: FieldRef, value: Expr },
    /// Reduce into a row of a field (centered or scattered).
    ReduceField { field: FieldRef, key: Key, op: ReduceOp, value: Expr },
    ReduceGlobal { global: GlobalId, op: ReduceOp, value: Expr },
    If { cond: Expr, then_s: Vec<Stmt>, else_s: Vec<Stmt> },
    /// Iterate the rows of a grouped relation whose key equals the centered
    /// row, binding `var` to each row's key handle.
    ForQuery { var: String, relation: RelationId, body: Vec<Stmt> },
    /// Insert a full record into an elastic relation.
    Insert { relation: RelationId, values: Vec<(String, Expr)> },
    /// Delete the centered row of the (elastic) launch relation.
    Delete,
}

/// One user kernel: a statement list mapped over a launch relation.
#[derive(Clone, Debug)]
pub struct KernelDef {
    pub name: String,
    pub relation: RelationId,
    pub body: Vec<Stmt>,
}

impl KernelDef {
    pub fn new(name: &str, relation: RelationId, body: Vec<Stmt>) -> Self {
        Self { name: name.to_string(), relation, body }
    }
}

// --- construction helpers ---------------------------------------------------
//
// Thin sugar so kernels read close to their surface syntax. These are used
// pervasively by tests and by embedding programs.

pub fn con(v: impl Into<Value>) -> Expr {
    Expr::Const(v.into())
}

pub fn local(name: &str) -> Expr {
    Expr::Local(name.to_string())
}

pub fn row_index() -> Expr {
    Expr::RowIndex
}

pub fn read_global(g: &Global) -> Expr {
    Expr::ReadGlobal(g.id())
}

/// Read the centered row of `field`.
pub fn read(field: &Field) -> Expr {
    Expr::ReadField { field: field.into(), key: Key::Centered }
}

/// Read `field` at a grid offset from the centered cell.
pub fn read_at(field: &Field, offset: &[i64]) -> Expr {
    Expr::ReadField { field: field.into(), key: Key::Offset(offset.to_vec()) }
}

/// Read `field` through a computed key.
pub fn read_key(field: &Field, key: Expr) -> Expr {
    Expr::ReadField { field: field.into(), key: Key::Expr(Box::new(key)) }
}

pub fn in_bounds(offset: &[i64]) -> Expr {
    Expr::InBounds(offset.to_vec())
}

pub fn cast(kind: ScalarKind, e: Expr) -> Expr {
    Expr::Cast(kind, Box::new(e))
}

pub fn assign(field: &Field, value: Expr) -> Stmt {
    Stmt::Assign { field: field.into(), value }
}

pub fn reduce_field(field: &Field, key: Key, op: ReduceOp, value: Expr) -> Stmt {
    Stmt::ReduceField { field: field.into(), key, op, value }
}

pub fn reduce_global(g: &Global, op: ReduceOp, value: Expr) -> Stmt {
    Stmt::ReduceGlobal { global: g.id(), op, value }
}

pub fn let_(name: &str, value: Expr) -> Stmt {
    Stmt::Let { name: name.to_string(), value }
}

pub fn if_(cond: Expr, then_s: Vec<Stmt>) -> Stmt {
    Stmt::If { cond, then_s, else_s: Vec::new() }
}

pub fn if_else(cond: Expr, then_s: Vec<Stmt>, else_s: Vec<Stmt>) -> Stmt {
    Stmt::If { cond, then_s, else_s }
}

pub fn for_query(var: &str, relation: RelationId, body: Vec<Stmt>) -> Stmt {
    Stmt::ForQuery { var: var.to_string(), relation, body }
}

pub fn insert(relation: RelationId, values: Vec<(&str, Expr)>) -> Stmt {
    Stmt::Insert {
        relation,
        values: values.into_iter().map(|(n, e)| (n.to_string(), e)).collect(),
    }
}

impl Expr {
    fn bin(self, op: BinOp, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(self), Box::new(rhs))
    }

    pub fn add(self, rhs: Expr) -> Expr {
        self.bin(BinOp::Add, rhs)
    }

    pub fn sub(self, rhs: Expr) -> Expr {
        self.bin(BinOp::Sub, rhs)
    }

    pub fn mul(self, rhs: Expr) -> Expr {
        self.bin(BinOp::Mul, rhs)
    }

    pub fn div(self, rhs: Expr) -> Expr {
        self.bin(BinOp::Div, rhs)
    }

    pub fn rem(self, rhs: Expr) -> Expr {
        self.bin(BinOp::Mod, rhs)
    }

    pub fn eq(self, rhs: Expr) -> Expr {
        self.bin(BinOp::Eq, rhs)
    }

    pub fn ne(self, rhs: Expr) -> Expr {
        self.bin(BinOp::Ne, rhs)
    }

    pub fn lt(self, rhs: Expr) -> Expr {
        self.bin(BinOp::Lt, rhs)
    }

    pub fn le(self, rhs: Expr) -> Expr {
        self.bin(BinOp::Le, rhs)
    }

    pub fn gt(self, rhs: Expr) -> Expr {
        self.bin(BinOp::Gt, rhs)
    }

    pub fn ge(self, rhs: Expr) -> Expr {
        self.bin(BinOp::Ge, rhs)
    }

    pub fn and(self, rhs: Expr) -> Expr {
        self.bin(BinOp::And, rhs)
    }

    pub fn or(self, rhs: Expr) -> Expr {
        self.bin(BinOp::Or, rhs)
    }

    pub fn neg(self) -> Expr {
        Expr::Unary(UnOp::Neg, Box::new(self))
    }

    pub fn not(self) -> Expr {
        Expr::Unary(UnOp::Not, Box::new(self))
    }

    pub fn lane(self, lane: usize) -> Expr {
        Expr::Index { base: Box::new(self), lane }
    }
}
