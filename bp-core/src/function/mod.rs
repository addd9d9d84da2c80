//! The intrinsic-function subsystem: AST (§3), parser (§4.6), and the
//! two-phase evaluator (§4.7).

pub mod ast;
pub mod eval;
pub mod parser;

pub use ast::{Expr, NodeRef};
pub use eval::{
    evaluate_runtime, evaluate_static, AttributeLookup, EvalContext, InputLookup, PropertyLookup,
    SecretFetchError, SecretFetcher,
};
