//! Core language behavior: literals, operators, variables, control
//! flow, strings, containers, method definitions.

mod common;
use common::*;

#[test]
fn test_arithmetic() {
    let mut interp = new_interp();
    assert_int(&mut interp, "1 + 2 * 3", 7);
    assert_int(&mut interp, "(1 + 2) * 3", 9);
    assert_int(&mut interp, "10 - 4 - 3", 3);
    assert_int(&mut interp, "2 * 3 + 4 * 5", 26);
}

#[test]
fn test_floor_division_and_modulo() {
    let mut interp = new_interp();
    assert_int(&mut interp, "7 / 2", 3);
    assert_int(&mut interp, "-7 / 2", -4);
    assert_int(&mut interp, "7 / -2", -4);
    assert_int(&mut interp, "-7 % 2", 1);
    assert_int(&mut interp, "7 % -2", -1);
    assert_int(&mut interp, "10 % 3", 1);
}

#[test]
fn test_integer_wrapping() {
    let mut interp = new_interp();
    assert_int(&mut interp, "9223372036854775807 + 1", i64::MIN);
}

#[test]
fn test_division_by_zero() {
    let mut interp = new_interp();
    let err = eval_err(&mut interp, "1/0");
    assert_eq!(err.kind, "ZeroDivisionError");
    let err = eval_err(&mut interp, "1.5 / 0");
    assert_eq!(err.kind, "ZeroDivisionError");
    assert_int(&mut interp, "begin; 1/0; rescue => e; 99; end", 99);
}

#[test]
fn test_comparisons_and_logic() {
    let mut interp = new_interp();
    assert_bool(&mut interp, "1 < 2", true);
    assert_bool(&mut interp, "2 <= 2", true);
    assert_bool(&mut interp, "3 == 3.0", true);
    assert_bool(&mut interp, "1 == 2 || 3 == 3", true);
    assert_bool(&mut interp, "1 == 1 && 2 == 3", false);
    assert_bool(&mut interp, "!(1 == 1)", false);
    // short-circuit keeps the evaluated operand
    assert_int(&mut interp, "nil || 5", 5);
    assert_int(&mut interp, "2 && 3", 3);
    assert_nil(&mut interp, "nil && 3");
}

#[test]
fn test_global_variables_persist_across_evals() {
    let mut interp = new_interp();
    eval(&mut interp, "x = 41");
    assert_int(&mut interp, "x + 1", 42);
}

#[test]
fn test_conditionals() {
    let mut interp = new_interp();
    assert_int(&mut interp, "if 1 < 2 then 5 else 6 end", 5);
    assert_int(&mut interp, "if 1 > 2\n 5\n elsif 2 > 1\n 7\n else\n 6\n end", 7);
    assert_int(&mut interp, "unless false\n 1\n else\n 2\n end", 1);
    assert_int(&mut interp, "x = 1 > 0 ? 10 : 20; x", 10);
    assert_int(&mut interp, "v = 5; v = 6 if false; v", 5);
    assert_int(&mut interp, "v = 5; v = 6 unless false; v", 6);
}

#[test]
fn test_while_and_until() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "i = 0; total = 0; while i < 5; total = total + i; i = i + 1; end; total",
        10,
    );
    assert_int(&mut interp, "i = 0; until i >= 3; i = i + 1; end; i", 3);
    assert_int(&mut interp, "i = 0; i = i + 1 while i < 4; i", 4);
}

#[test]
fn test_loop_with_break() {
    let mut interp = new_interp();
    assert_int(&mut interp, "i = 0; loop do; i = i + 1; break if i == 5; end; i", 5);
    assert_int(&mut interp, "i = 0; r = loop do; i = i + 1; break i * 2 if i == 3; end; r", 6);
}

#[test]
fn test_case_when() {
    let mut interp = new_interp();
    assert_str(
        &mut interp,
        "case 5\nwhen 1, 2 then \"lo\"\nwhen 5 then \"hi\"\nelse \"no\"\nend",
        "hi",
    );
    assert_str(&mut interp, "case 99\nwhen 1 then \"a\"\nelse \"other\"\nend", "other");
    // class filters go through ===
    assert_str(
        &mut interp,
        "case \"s\"\nwhen Integer then \"int\"\nwhen String then \"str\"\nend",
        "str",
    );
    // range filters
    assert_str(
        &mut interp,
        "case 7\nwhen 1..5 then \"small\"\nwhen 6..10 then \"mid\"\nend",
        "mid",
    );
}

#[test]
fn test_strings() {
    let mut interp = new_interp();
    assert_str(&mut interp, "\"ab\" + \"cd\"", "abcd");
    assert_int(&mut interp, "(\"ab\" + \"cd\").length", 4);
    assert_str(&mut interp, "\"ab\" * 3", "ababab");
    assert_bool(&mut interp, "\"abc\" == \"abc\"", true);
    assert_str(&mut interp, "x = 5; \"v=#{x + 1}!\"", "v=6!");
    assert_str(&mut interp, "'no #{interp} here'", "no #{interp} here");
    assert_str(&mut interp, "\"hello\".upcase", "HELLO");
    assert_str(&mut interp, "\"HELLO\".downcase", "hello");
    assert_int(&mut interp, "\"hello\".chars.length", 5);
    assert_str(&mut interp, "\"a,b,c\".split(\",\")[1]", "b");
    assert_int(&mut interp, "\"hello\".index(\"llo\")", 2);
    assert_bool(&mut interp, "\"hello\".include?(\"ell\")", true);
    assert_bool(&mut interp, "\"hello\".start_with?(\"he\")", true);
    assert_str(&mut interp, "\"  x  \".strip", "x");
    assert_str(&mut interp, "\"banana\".sub(\"an\", \"AN\")", "bANana");
    assert_str(&mut interp, "\"banana\".gsub(\"an\", \"AN\")", "bANANa");
    assert_str(&mut interp, "\"abc\"[1]", "b");
    assert_str(&mut interp, "\"abcdef\"[1, 3]", "bcd");
}

#[test]
fn test_string_conversions() {
    let mut interp = new_interp();
    assert_int(&mut interp, "\"42\".to_i", 42);
    assert_int(&mut interp, "\"12abc\".to_i", 12);
    assert_int(&mut interp, "Integer(\"17\")", 17);
    assert_str(&mut interp, "12.to_s", "12");
    assert_str(&mut interp, "1.5.to_s", "1.5");
    assert_str(&mut interp, "2.0.to_s", "2.0");
    assert_str(&mut interp, ":sym.to_s", "sym");
    assert_str(&mut interp, "\"name\".to_sym.to_s", "name");
}

#[test]
fn test_heredoc() {
    let mut interp = new_interp();
    assert_str(&mut interp, "x = <<END\nHello World\nEND\nx", "Hello World\n");
    assert_str(&mut interp, "x = <<-END\n  text\n  END\nx", "  text\n");
    assert_int(&mut interp, "x = <<T\nab\nT\nx.length", 3);
    assert_str(&mut interp, "n = 3; x = <<T\ngot #{n}\nT\nx", "got 3\n");
}

#[test]
fn test_arrays() {
    let mut interp = new_interp();
    assert_int(&mut interp, "a = [1,2,3]; a[1]", 2);
    assert_int(&mut interp, "a = [1,2,3]; a[1] = 9; a[1]", 9);
    assert_int(&mut interp, "a = [1,2,3]; a[-1]", 3);
    assert_nil(&mut interp, "[1,2,3][10]");
    assert_int(&mut interp, "len([1,2,3])", 3);
    assert_int(&mut interp, "length([1,2,3,4])", 4);
    assert_ints(&mut interp, "[1,2] + [3]", &[1, 2, 3]);
    assert_ints(&mut interp, "a = [1]; a.push(2); a << 3; a", &[1, 2, 3]);
    assert_int(&mut interp, "[5,6,7].first", 5);
    assert_int(&mut interp, "[5,6,7].last", 7);
    assert_str(&mut interp, "[1,2,3].join(\"-\")", "1-2-3");
    assert_ints(&mut interp, "[3,1,2].sort", &[1, 2, 3]);
    assert_ints(&mut interp, "[1,[2,[3]]].flatten", &[1, 2, 3]);
    assert_ints(&mut interp, "[1,2,1,3].uniq", &[1, 2, 3]);
    assert_bool(&mut interp, "[1,2].include?(2)", true);
    assert_int(&mut interp, "a = [1,2,3]; a.delete(2); a.length", 2);
    assert_int(&mut interp, "a = [1,2]; a[5] = 9; a.length", 6);
}

#[test]
fn test_hashes() {
    let mut interp = new_interp();
    assert_int(&mut interp, "h = {\"x\" => 9}; h[\"x\"]", 9);
    assert_int(&mut interp, "h = {a: 1, b: 2}; h[:b]", 2);
    assert_int(&mut interp, "h = {}; h[:k] = 5; h[:k]", 5);
    assert_nil(&mut interp, "({})[:missing]");
    assert_int(&mut interp, "{a: 1, b: 2}.length", 2);
    assert_bool(&mut interp, "{a: 1}.key?(:a)", true);
    assert_int(&mut interp, "h = {a: 1, b: 2}; h.delete(:a); h.length", 1);
    // insertion order is observable
    assert_str(&mut interp, "h = {}; h[:z] = 1; h[:a] = 2; h.keys[0].to_s", "z");
    // int and float keys unify like ==
    assert_int(&mut interp, "h = {1 => 10}; h[1.0]", 10);
}

#[test]
fn test_ranges() {
    let mut interp = new_interp();
    assert_ints(&mut interp, "(1..5).to_a", &[1, 2, 3, 4, 5]);
    assert_ints(&mut interp, "(1...4).to_a", &[1, 2, 3]);
    assert_int(&mut interp, "(1..10).size", 10);
    assert_bool(&mut interp, "(1..5).include?(3)", true);
    assert_bool(&mut interp, "(1...5).include?(5)", false);
    assert_int(&mut interp, "(1..4).sum", 10);
}

#[test]
fn test_method_definition_and_call() {
    let mut interp = new_interp();
    assert_int(&mut interp, "def f(x); x * 2; end; f(21)", 42);
    assert_int(&mut interp, "def g(a, b = 10); a + b; end; g(1)", 11);
    assert_int(&mut interp, "g(1, 2)", 3);
    assert_int(&mut interp, "def h(*rest); len(rest); end; h(1, 2, 3)", 3);
    assert_int(&mut interp, "def pick(a, *r); r[0]; end; pick(1, 2, 3)", 2);
    // splat at the call site
    assert_int(&mut interp, "def sum3(a, b, c); a + b + c; end; args = [1,2,3]; sum3(*args)", 6);
    let err = eval_err(&mut interp, "def one(a); a; end; one(1, 2)");
    assert_eq!(err.kind, "ArgumentError");
}

#[test]
fn test_recursion() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "def fact(n); n <= 1 ? 1 : n * fact(n - 1); end; fact(10)",
        3628800,
    );
    assert_int(
        &mut interp,
        "def fib(n); n < 2 ? n : fib(n - 1) + fib(n - 2); end; fib(15)",
        610,
    );
}

#[test]
fn test_multiple_assignment() {
    let mut interp = new_interp();
    assert_int(&mut interp, "a, b = 1, 2; a + b * 10", 21);
    assert_int(&mut interp, "a, b = [5, 6]; b", 6);
    assert_ints(&mut interp, "x, *rest = [1, 2, 3]; rest", &[2, 3]);
    assert_ints(&mut interp, "a = 1; b = 2; a, b = b, a; [a, b]", &[2, 1]);
    assert_nil(&mut interp, "a, b = [1]; b");
}

#[test]
fn test_op_assign() {
    let mut interp = new_interp();
    assert_int(&mut interp, "x = 1; x += 4; x", 5);
    assert_int(&mut interp, "x = 10; x -= 3; x *= 2; x", 14);
    assert_int(&mut interp, "y = nil; y ||= 7; y ||= 9; y", 7);
    assert_int(&mut interp, "z = 1; z &&= 2; z", 2);
    assert_int(&mut interp, "a = [1,2]; a[0] += 10; a[0]", 11);
    assert_int(&mut interp, "h = {}; h[:n] ||= 3; h[:n]", 3);
}

#[test]
fn test_for_loop_leaks_variable() {
    let mut interp = new_interp();
    assert_int(&mut interp, "total = 0; for x in [1,2,3]; total = total + x; end; total", 6);
    // the loop variable outlives the loop, unlike a block parameter
    assert_int(&mut interp, "for v in [1,2,3]; end; v", 3);
    assert_int(&mut interp, "def f; for q in [7, 8]; end; q; end; f()", 8);
}

#[test]
fn test_safe_navigation() {
    let mut interp = new_interp();
    assert_nil(&mut interp, "a = nil; a&.length");
    assert_int(&mut interp, "\"abc\"&.length", 3);
    assert_nil(&mut interp, "a = nil; a&.foo&.bar");
}

#[test]
fn test_last_expression_is_result() {
    let mut interp = new_interp();
    assert_int(&mut interp, "1; 2; 3", 3);
    assert_nil(&mut interp, "x = 1; while false; end");
}

#[test]
fn test_symbols_are_interned() {
    let mut interp = new_interp();
    assert_bool(&mut interp, ":abc == :abc", true);
    assert_bool(&mut interp, ":abc == :abd", false);
    assert_bool(&mut interp, ":abc == \"abc\"", false);
}

#[test]
fn test_float_arithmetic() {
    let mut interp = new_interp();
    assert_bool(&mut interp, "1.5 + 2.5 == 4.0", true);
    assert_bool(&mut interp, "1 + 0.5 == 1.5", true);
    assert_int(&mut interp, "3.7.to_i", 3);
    assert_int(&mut interp, "3.2.floor", 3);
    assert_int(&mut interp, "3.2.ceil", 4);
    assert_int(&mut interp, "3.5.round", 4);
}
