use insta::assert_snapshot;
use treecalc_expr::{parse_expr, read_sexpr, symbol, ErrorContext, Expr, Symbol};

#[test]
fn loop_iteration_text_parses_to_template_call() {
    let e = parse_expr("body(UInt16(2), iter1/nextValue)").unwrap();
    assert_snapshot!(e.to_string(), @"(body (UInt16 2) iter1/nextValue)");
    assert_eq!(e.head(), Some(Symbol::intern("body")));
}

#[test]
fn mixed_expression_snapshot() {
    let e = parse_expr("iif(a >= 0, sum(x->value) / #x, -1)").unwrap();
    assert_snapshot!(e.to_string(), @"(iif (ge a 0) (div (sum (arrow x value)) (NrOfRows x)) -1)");
}

#[test]
fn identical_text_gives_equal_keys() {
    let a = parse_expr("scope(regions, name + 1)").unwrap();
    let b = read_sexpr("(scope regions (add name 1))").unwrap();
    assert_eq!(a, b);
    assert!(a.is_call_of(symbol::SCOPE));
}

#[test]
fn symbol_enumeration_covers_paths() {
    let e = parse_expr("a/b + ../c").unwrap();
    let names: Vec<String> = e.symbols().iter().map(|s| s.to_string()).collect();
    assert_eq!(names, vec!["add", "a/b", "../c"]);
}

#[test]
fn error_context_renders_caret() {
    let source = "a + * b";
    let err = parse_expr(source).unwrap_err();
    let rendered = ErrorContext::new(source, &err).to_string();
    assert!(rendered.starts_with("Error at line 1, column 5:"));
}

#[test]
fn strings_keep_escapes() {
    let e = parse_expr(r#""say \"hi\"""#).unwrap();
    assert_eq!(e, Expr::string("say \"hi\""));
    assert_eq!(read_sexpr(&e.to_string()).unwrap(), e);
}
