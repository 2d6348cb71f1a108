//! Metric formula language.
//!
//! Formulas combine counter columns (`pmcN`, `virtN`), numeric literals and
//! the operators `+ - * /` with parentheses. A formula is parsed and checked
//! once into a [`Formula`], bound once per output header into a
//! [`BoundFormula`], and then evaluated for every sample row.

use std::fmt;

use chumsky::prelude::*;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Neg(Box<Expr>),
    Variable(String),
    Num(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A counter column a formula may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    Pmc(u32),
    Virt(u32),
}

impl Counter {
    pub fn from_name(name: &str) -> Option<Counter> {
        fn index(digits: &str) -> Option<u32> {
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()
        }

        if let Some(digits) = name.strip_prefix("pmc") {
            index(digits).map(Counter::Pmc)
        } else if let Some(digits) = name.strip_prefix("virt") {
            index(digits).map(Counter::Virt)
        } else {
            None
        }
    }

    /// Column name used by the monitoring command's header row.
    pub fn column_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Counter::Pmc(n) => write!(f, "pmc{n}"),
            Counter::Virt(n) => write!(f, "virt{n}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("invalid formula '{formula}': {reason}")]
    Parse { formula: String, reason: String },
    #[error("unknown variable '{name}' in formula '{formula}' (expected pmcN or virtN)")]
    UnknownVariable { formula: String, name: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("division by zero")]
    DivideByZero,
    #[error("row has no field at column {0}")]
    MissingField(usize),
    #[error("field '{value}' at column {column} is not a number")]
    InvalidValue { column: usize, value: String },
}

type Extra<'src> = extra::Err<Rich<'src, char>>;

pub fn parse_expr(str_expr: &str) -> Result<Expr, FormulaError> {
    let parser = expr().then_ignore(end());

    parser.parse(str_expr).into_result().map_err(|errs| FormulaError::Parse {
        formula: str_expr.to_string(),
        reason: errs
            .iter()
            .map(|err| err.to_string())
            .collect::<Vec<_>>()
            .join("; "),
    })
}

fn ident<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_ascii_alphanumeric() || *c == '_')
        .repeated()
        .at_least(1)
        .collect::<String>()
        .and_is(any().filter(|c: &char| c.is_alphabetic()))
}

fn variable<'src>() -> impl Parser<'src, &'src str, Expr, Extra<'src>> + Clone {
    ident().map(Expr::Variable)
}

fn num<'src>() -> impl Parser<'src, &'src str, Expr, Extra<'src>> + Clone {
    text::int(10)
        .then(just('.').then(text::digits(10)).or_not())
        .to_slice()
        .from_str()
        .unwrapped()
        .map(Expr::Num)
}

fn expr<'src>() -> impl Parser<'src, &'src str, Expr, Extra<'src>> {
    recursive(|expr| {
        let atom = num()
            .or(variable())
            .or(expr.clone().delimited_by(just("("), just(")")))
            .padded()
            .boxed();

        let unary = just("-")
            .padded()
            .or_not()
            .then(atom)
            .map(|(neg, operand)| match neg {
                Some(_) => Expr::Neg(Box::new(operand)),
                None => operand,
            })
            .boxed();

        let product_op = just("*")
            .padded()
            .to(BinOp::Mul)
            .or(just("/").padded().to(BinOp::Div));
        let product = unary
            .clone()
            .foldl(product_op.then(unary).repeated(), |lhs, (op, rhs)| {
                Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                }
            });

        let sum_op = just("+")
            .padded()
            .to(BinOp::Add)
            .or(just("-").padded().to(BinOp::Sub));

        product
            .clone()
            .foldl(sum_op.then(product).repeated(), |lhs, (op, rhs)| {
                Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                }
            })
    })
}

/// A parsed formula whose variables are known to be counter columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    text: String,
    expr: Expr,
    counters: Vec<Counter>,
}

impl Formula {
    pub fn compile(text: &str) -> Result<Formula, FormulaError> {
        let expr = parse_expr(text)?;

        let mut counters = vec![];
        collect_counters(&expr, text, &mut counters)?;
        counters.sort();
        counters.dedup();

        Ok(Formula {
            text: text.to_string(),
            expr,
            counters,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Counters referenced by the formula, sorted and deduplicated.
    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    /// Resolves every counter to a column position. Returns the first counter
    /// that `column_of` cannot place.
    pub fn bind<F>(&self, column_of: F) -> Result<BoundFormula, Counter>
    where
        F: Fn(&str) -> Option<usize>,
    {
        Ok(BoundFormula {
            root: bind_expr(&self.expr, &column_of)?,
        })
    }
}

fn collect_counters(
    expr: &Expr,
    formula: &str,
    counters: &mut Vec<Counter>,
) -> Result<(), FormulaError> {
    match expr {
        Expr::Binary { lhs, rhs, .. } => {
            collect_counters(lhs, formula, counters)?;
            collect_counters(rhs, formula, counters)
        }
        Expr::Neg(operand) => collect_counters(operand, formula, counters),
        Expr::Variable(name) => {
            let counter =
                Counter::from_name(name).ok_or_else(|| FormulaError::UnknownVariable {
                    formula: formula.to_string(),
                    name: name.clone(),
                })?;
            counters.push(counter);
            Ok(())
        }
        Expr::Num(_) => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Num(f64),
    Field(usize),
    Neg(Box<Node>),
    Binary {
        op: BinOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
}

fn bind_expr<F>(expr: &Expr, column_of: &F) -> Result<Node, Counter>
where
    F: Fn(&str) -> Option<usize>,
{
    match expr {
        Expr::Binary { op, lhs, rhs } => Ok(Node::Binary {
            op: *op,
            lhs: Box::new(bind_expr(lhs, column_of)?),
            rhs: Box::new(bind_expr(rhs, column_of)?),
        }),
        Expr::Neg(operand) => Ok(Node::Neg(Box::new(bind_expr(operand, column_of)?))),
        Expr::Variable(name) => {
            // Names were validated by Formula::compile.
            let counter = Counter::from_name(name).unwrap_or(Counter::Pmc(u32::MAX));
            column_of(&counter.column_name())
                .map(Node::Field)
                .ok_or(counter)
        }
        Expr::Num(num) => Ok(Node::Num(*num)),
    }
}

/// A formula with its counters resolved to column positions of one header.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundFormula {
    root: Node,
}

impl BoundFormula {
    /// Evaluates the formula over the whitespace-separated fields of a row.
    pub fn evaluate(&self, fields: &[&str]) -> Result<f64, EvalError> {
        eval_node(&self.root, fields)
    }
}

fn eval_node(node: &Node, fields: &[&str]) -> Result<f64, EvalError> {
    match node {
        Node::Num(num) => Ok(*num),
        Node::Field(column) => {
            let value = fields
                .get(*column)
                .ok_or(EvalError::MissingField(*column))?;
            value.parse::<f64>().map_err(|_| EvalError::InvalidValue {
                column: *column,
                value: value.to_string(),
            })
        }
        Node::Neg(operand) => Ok(-eval_node(operand, fields)?),
        Node::Binary { op, lhs, rhs } => {
            let lhs = eval_node(lhs, fields)?;
            let rhs = eval_node(rhs, fields)?;
            match op {
                BinOp::Add => Ok(lhs + rhs),
                BinOp::Sub => Ok(lhs - rhs),
                BinOp::Mul => Ok(lhs * rhs),
                BinOp::Div => {
                    if rhs == 0.0 {
                        Err(EvalError::DivideByZero)
                    } else {
                        Ok(lhs / rhs)
                    }
                }
            }
        }
    }
}
