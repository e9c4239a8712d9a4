//! The generic Enumerable mixin: a user class defines `each`, includes
//! the module, and gets the whole combinator surface; the built-in
//! containers acquire theirs the same way.

mod common;
use common::*;

fn interp_with_numbers() -> ruse_runtime::Interp {
    let mut interp = new_interp();
    eval(
        &mut interp,
        "class Numbers\n\
           include Enumerable\n\
           def initialize(arr)\n\
             @data = arr\n\
           end\n\
           def each(&blk)\n\
             i = 0\n\
             while i < @data.length\n\
               blk.call(@data[i])\n\
               i = i + 1\n\
             end\n\
           end\n\
         end\n\
         nums = Numbers.new([10, 20, 30, 40, 50])",
    );
    interp
}

#[test]
fn test_custom_class_gains_combinators_from_each() {
    let mut interp = interp_with_numbers();
    assert_ints(&mut interp, "nums.to_a", &[10, 20, 30, 40, 50]);
    assert_ints(&mut interp, "nums.entries", &[10, 20, 30, 40, 50]);
    assert_ints(&mut interp, "nums.map { |x| x * 2 }", &[20, 40, 60, 80, 100]);
    assert_ints(&mut interp, "nums.collect { |x| x + 1 }", &[11, 21, 31, 41, 51]);
    assert_ints(&mut interp, "nums.select { |x| x > 25 }", &[30, 40, 50]);
    assert_ints(&mut interp, "nums.reject { |x| x > 25 }", &[10, 20]);
    assert_int(&mut interp, "nums.find { |x| x > 25 }", 30);
    assert_nil(&mut interp, "nums.find { |x| x > 99 }");
}

#[test]
fn test_custom_class_counting_and_membership() {
    let mut interp = interp_with_numbers();
    assert_int(&mut interp, "nums.count", 5);
    assert_int(&mut interp, "nums.count { |x| x > 25 }", 3);
    assert_bool(&mut interp, "nums.include?(30)", true);
    assert_bool(&mut interp, "nums.include?(99)", false);
}

#[test]
fn test_custom_class_folds() {
    let mut interp = interp_with_numbers();
    assert_int(&mut interp, "nums.min", 10);
    assert_int(&mut interp, "nums.max", 50);
    assert_int(&mut interp, "nums.sum", 150);
    assert_int(&mut interp, "nums.reduce(0) { |acc, x| acc + x }", 150);
    assert_int(&mut interp, "nums.reduce { |acc, x| acc + x }", 150);
    assert_bool(&mut interp, "nums.any? { |x| x == 30 }", true);
    assert_bool(&mut interp, "nums.any? { |x| x == 31 }", false);
    assert_bool(&mut interp, "nums.all? { |x| x > 0 }", true);
    assert_bool(&mut interp, "nums.none? { |x| x < 0 }", true);
    assert_int(&mut interp, "nums.min_by { |x| 0 - x }", 50);
    assert_int(&mut interp, "nums.max_by { |x| 0 - x }", 10);
}

#[test]
fn test_custom_class_ordering_and_slicing() {
    let mut interp = interp_with_numbers();
    eval(&mut interp, "unordered = Numbers.new([30, 10, 50, 20, 40])");
    assert_ints(&mut interp, "unordered.sort", &[10, 20, 30, 40, 50]);
    assert_ints(&mut interp, "nums.sort_by { |x| 0 - x }", &[50, 40, 30, 20, 10]);
    assert_ints(
        &mut interp,
        "nums.flat_map { |x| [x, x + 1] }",
        &[10, 11, 20, 21, 30, 31, 40, 41, 50, 51],
    );
    assert_ints(
        &mut interp,
        "indices = []; nums.each_with_index { |x, idx| indices.push(idx) }; indices",
        &[0, 1, 2, 3, 4],
    );
    assert_int(&mut interp, "nums.first", 10);
    assert_ints(&mut interp, "nums.first(3)", &[10, 20, 30]);
    assert_ints(&mut interp, "nums.take(2)", &[10, 20]);
    assert_ints(&mut interp, "nums.drop(3)", &[40, 50]);
}

#[test]
fn test_enumerable_with_bytecode_each() {
    let mut interp = new_interp();
    // each written with the yield keyword instead of an explicit block
    // parameter; break can short-circuit it directly
    eval(
        &mut interp,
        "class Trio\n\
           include Enumerable\n\
           def initialize(a, b, c)\n\
             @a = a\n\
             @b = b\n\
             @c = c\n\
           end\n\
           def each\n\
             yield @a\n\
             yield @b\n\
             yield @c\n\
           end\n\
         end",
    );
    assert_ints(&mut interp, "Trio.new(10, 20, 30).map { |x| x + 1 }", &[11, 21, 31]);
    assert_int(&mut interp, "Trio.new(1, 2, 3).sum", 6);
    assert_int(&mut interp, "Trio.new(7, 8, 9).each { |x| break x * 10 }", 70);
}

#[test]
fn test_builtins_share_the_mixin() {
    let mut interp = new_interp();
    for class in ["Array", "Range", "Hash"] {
        assert_bool(
            &mut interp,
            &format!("{class}.ancestors.include?(Enumerable)"),
            true,
        );
    }
    assert_bool(&mut interp, "Array.method_defined?(:min_by)", true);
    assert_ints(&mut interp, "[3, 1, 2].sort_by { |x| 0 - x }", &[3, 2, 1]);
    assert_int(&mut interp, "(1..5).max_by { |x| 0 - x }", 1);
    assert_ints(&mut interp, "{a: 1, b: 2}.map { |k, v| v * 10 }", &[10, 20]);
    assert_int(&mut interp, "{a: 1, b: 2, c: 3}.count", 3);
    assert_ints(&mut interp, "(1..3).flat_map { |x| [x, x] }", &[1, 1, 2, 2, 3, 3]);
}

#[test]
fn test_mixin_respects_method_resolution_order() {
    let mut interp = new_interp();
    let out = eval(&mut interp, "class Bag; include Enumerable; def each; yield 1; end; end; \
                                 Bag.ancestors.map { |c| c.name }");
    let ruse_runtime::Value::Array(arr) = out else { panic!("expected array") };
    let names: Vec<String> = arr
        .borrow()
        .elems
        .iter()
        .map(|v| match v {
            ruse_runtime::Value::Str(s) => s.borrow().as_str_lossy().into_owned(),
            other => panic!("expected string, got {other:?}"),
        })
        .collect();
    assert_eq!(names, vec!["Bag", "Enumerable", "Object"]);
    // a class's own definition still wins over the mixin
    assert_int(
        &mut interp,
        "class Bag; def sum; 42; end; end; Bag.new.sum",
        42,
    );
}
