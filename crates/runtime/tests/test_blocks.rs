//! Blocks and iterators: yield, closures, break/next/redo, the block
//! signal contract for both bytecode and native iterators.

mod common;
use common::*;

#[test]
fn test_each_and_map() {
    let mut interp = new_interp();
    assert_int(&mut interp, "total = 0; [1,2,3].each { |x| total = total + x }; total", 6);
    assert_ints(&mut interp, "[1,2,3].map { |x| x * 2 }", &[2, 4, 6]);
    assert_ints(&mut interp, "[1,2,3,4].select { |x| x % 2 == 0 }", &[2, 4]);
    assert_ints(&mut interp, "[1,2,3,4].reject { |x| x % 2 == 0 }", &[1, 3]);
    assert_int(&mut interp, "[1,2,3].reduce { |a, b| a + b }", 6);
    assert_int(&mut interp, "[1,2,3].reduce(10) { |a, b| a + b }", 16);
    assert_int(&mut interp, "[1,2,3].sum", 6);
    assert_int(&mut interp, "[5,1,9].max", 9);
    assert_int(&mut interp, "[5,1,9].min", 1);
    assert_int(&mut interp, "[1,2,3,4].count { |x| x > 2 }", 2);
    assert_int(&mut interp, "[1,2,3,4].count", 4);
    assert_int(&mut interp, "[1,2,3].find { |x| x > 1 }", 2);
    assert_bool(&mut interp, "[1,2].any? { |x| x == 2 }", true);
    assert_bool(&mut interp, "[1,2].all? { |x| x > 0 }", true);
}

#[test]
fn test_native_array_map() {
    let mut interp = new_interp();
    assert_ints(&mut interp, "array_map([1,2,3]) { |x| x * 2 }", &[2, 4, 6]);
    // break makes the iterator itself return the value
    assert_int(&mut interp, "array_map([1,2,3]) { |x| break 42 if x == 2; x }", 42);
}

#[test]
fn test_with_index_forms() {
    let mut interp = new_interp();
    assert_ints(&mut interp, "[10, 20, 30].map_with_index { |x, i| x + i }", &[10, 21, 32]);
    assert_int(&mut interp, "last = 0; [7, 8].each_with_index { |x, i| last = i }; last", 1);
    assert_int(
        &mut interp,
        "r = [1, 2, 3].each_with_object([]) { |x, memo| memo.push(x) }; len(r)",
        3,
    );
}

#[test]
fn test_times_and_upto() {
    let mut interp = new_interp();
    assert_int(&mut interp, "total = 0; 5.times { |i| total = total + i }; total", 10);
    assert_int(&mut interp, "total = 0; 2.upto(4) { |i| total = total + i }; total", 9);
    assert_int(&mut interp, "total = 0; 4.downto(2) { |i| total = total + i }; total", 9);
    assert_int(&mut interp, "total = 0; (1..4).each { |i| total = total + i }; total", 10);
}

#[test]
fn test_break_returns_value_from_iterator() {
    let mut interp = new_interp();
    assert_int(&mut interp, "[1,2,3,4].each { |x| break x * 10 if x == 3 }", 30);
    assert_nil(&mut interp, "[1,2,3].each { |x| break if x == 2 }");
    // break escapes nested blocks to the nearest iterator call
    assert_int(
        &mut interp,
        "r = [1,2].map { |x| [10, 20].each { |y| break y } }; r[0]",
        10,
    );
}

#[test]
fn test_next_replaces_or_discards() {
    let mut interp = new_interp();
    // map-like: next's value replaces the element
    assert_ints(&mut interp, "[1,2,3].map { |x| next 0 if x == 2; x }", &[1, 0, 3]);
    // each-like: next's value is discarded, iteration continues
    assert_int(
        &mut interp,
        "total = 0; [1,2,3].each { |x| next if x == 2; total = total + x }; total",
        4,
    );
}

#[test]
fn test_redo_reinvokes_block() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "i = 0; [1,2].each { |x| i = i + 1; redo if x == 1 && i == 1 }; i",
        3,
    );
}

#[test]
fn test_blocks_close_over_locals() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "def f; t = 0; [1,2,3].each { |x| t = t + x }; t; end; f()",
        6,
    );
    // the captured variable is shared by reference
    assert_int(
        &mut interp,
        "def counter; n = 0; lambda { n = n + 1; n }; end; c = counter(); c.call; c.call",
        2,
    );
}

#[test]
fn test_block_sym_shorthand() {
    let mut interp = new_interp();
    let out = eval(&mut interp, "[\"a\", \"b\"].map(&:upcase)");
    let ruse_runtime::Value::Array(arr) = out else { panic!("expected array") };
    let texts: Vec<String> = arr
        .borrow()
        .elems
        .iter()
        .map(|v| match v {
            ruse_runtime::Value::Str(s) => s.borrow().as_str_lossy().into_owned(),
            other => panic!("expected string, got {other:?}"),
        })
        .collect();
    assert_eq!(texts, vec!["A", "B"]);
}

#[test]
fn test_block_pass_through() {
    let mut interp = new_interp();
    assert_ints(
        &mut interp,
        "def via(a, &blk); a.map(&blk); end; via([1,2]) { |x| x + 1 }",
        &[2, 3],
    );
    assert_int(&mut interp, "total = 0; array_each([1,2,3]) { |x| total = total + x }; total", 6);
}

#[test]
fn test_return_inside_block_exits_defining_method() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "def first_big(a); a.each { |x| return x if x > 10 }; -1; end; first_big([2, 50, 99])",
        50,
    );
    assert_int(&mut interp, "first_big([1, 2])", -1);
}

#[test]
fn test_yield_arity_is_lenient() {
    let mut interp = new_interp();
    assert_nil(&mut interp, "def once; yield 1; end; once { |a, b| b }");
    assert_int(&mut interp, "def two; yield 1, 2; end; two { |a| a }", 1);
    // one array argument auto-splats across two params
    assert_int(&mut interp, "[[1, 2]].each { |a, b| return a + b }; 0", 3);
}

#[test]
fn test_no_block_given() {
    let mut interp = new_interp();
    let err = eval_err(&mut interp, "def needs; yield; end; needs()");
    assert!(err.message.contains("no block given"), "got: {}", err.message);
    assert_bool(&mut interp, "def q; block_given?; end; q { 1 }", true);
    assert_bool(&mut interp, "def q2; block_given?; end; q2()", false);
}

#[test]
fn test_lambda_and_call() {
    let mut interp = new_interp();
    assert_int(&mut interp, "double = lambda { |x| x * 2 }; double.call(21)", 42);
    assert_int(&mut interp, "p1 = proc { 9 }; p1.call", 9);
}

#[test]
fn test_zip_take_drop() {
    let mut interp = new_interp();
    assert_int(&mut interp, "z = [1,2].zip([10, 20]); z[1][1]", 20);
    assert_ints(&mut interp, "[1,2,3,4].take(2)", &[1, 2]);
    assert_ints(&mut interp, "[1,2,3,4].drop(2)", &[3, 4]);
}
