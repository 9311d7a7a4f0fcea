//! Property tests for the template expression engine.

use mcp_gateway::dsl::parser::{BinaryOp, Expr};
use mcp_gateway::dsl::{Value, eval, parse};
use proptest::prelude::*;

/// An identifier that is not a literal keyword.
fn ident() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,8}"
        .prop_filter("keywords are not identifiers", |s| {
            !matches!(s.as_str(), "true" | "false" | "null")
        })
}

/// Leaf expressions that always parse and print cleanly.
fn leaf() -> impl Strategy<Value = Expr> {
    prop_oneof![
        Just(Expr::Null),
        any::<bool>().prop_map(Expr::Bool),
        // Integer-valued literals keep printing exact.
        (-1_000_000i64..1_000_000i64).prop_map(|n| {
            #[allow(clippy::cast_precision_loss)]
            let n = n as f64;
            Expr::Number(n)
        }),
        ident().prop_map(Expr::Ident),
        "[ -~&&[^\"\\\\]]{0,12}".prop_map(Expr::Str),
    ]
}

/// Recursively composed expressions.
fn expr() -> impl Strategy<Value = Expr> {
    leaf().prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::Binary(
                BinaryOp::Add,
                Box::new(a),
                Box::new(b)
            )),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::Binary(
                BinaryOp::Mul,
                Box::new(a),
                Box::new(b)
            )),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::Binary(
                BinaryOp::Eq,
                Box::new(a),
                Box::new(b)
            )),
            (inner.clone(), inner.clone(), inner.clone()).prop_map(|(c, t, e)| Expr::Ternary(
                Box::new(c),
                Box::new(t),
                Box::new(e)
            )),
            (inner.clone(), ident())
                .prop_map(|(base, name)| Expr::Member(Box::new(base), name)),
            inner
                .clone()
                .prop_map(|e| Expr::Unary(mcp_gateway::dsl::parser::UnaryOp::Not, Box::new(e))),
            prop::collection::vec(inner, 0..4).prop_map(Expr::Array),
        ]
    })
}

proptest! {
    /// Printing any AST the printer produces re-parses to an equivalent AST.
    #[test]
    fn prop_print_parse_roundtrip(ast in expr()) {
        let printed = ast.to_string();
        let reparsed = parse(&printed)
            .unwrap_or_else(|e| panic!("printed '{printed}' failed to parse: {e}"));
        prop_assert_eq!(ast, reparsed);
    }

    /// Integer literals survive print/parse/eval exactly.
    #[test]
    fn prop_integer_literals_roundtrip(n in -1_000_000i64..1_000_000i64) {
        #[allow(clippy::cast_precision_loss)]
        let ast = Expr::Number(n as f64);
        let printed = ast.to_string();
        let reparsed = parse(&printed).unwrap();
        let root = Value::Map(std::collections::BTreeMap::new());
        #[allow(clippy::cast_precision_loss)]
        let expected = Value::Number(n as f64);
        prop_assert_eq!(eval(&reparsed, &root).unwrap(), expected);
    }

    /// String literals with arbitrary printable content escape correctly.
    #[test]
    fn prop_string_literals_roundtrip(s in "[ -~]{0,24}") {
        let ast = Expr::Str(s.clone());
        let printed = ast.to_string();
        let reparsed = parse(&printed)
            .unwrap_or_else(|e| panic!("printed {printed:?} failed to parse: {e}"));
        prop_assert_eq!(reparsed, Expr::Str(s));
    }

    /// Evaluation of a fixed pure expression is deterministic across runs.
    #[test]
    fn prop_pure_evaluation_deterministic(a in -1000i64..1000, b in -1000i64..1000) {
        #[allow(clippy::cast_precision_loss)]
        let root = Value::from_json(&serde_json::json!({"args": {"a": a as f64, "b": b as f64}}));
        let ast = parse("args.a * 2 + args.b").unwrap();
        let first = eval(&ast, &root).unwrap();
        let second = eval(&ast, &root).unwrap();
        prop_assert_eq!(first, second);
    }
}
