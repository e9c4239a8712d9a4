//! The object model: classes, modules, dispatch order, super,
//! visibility, hooks, reflection, keyword arguments.

mod common;
use common::*;
use ruse_runtime::Value;

#[test]
fn test_class_definition_and_instances() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "class Point; def initialize(x, y); @x = x; @y = y; end; def sum; @x + @y; end; end; \
         Point.new(3, 4).sum",
        7,
    );
    assert_str(&mut interp, "Point.new(0, 0).class.name", "Point");
    assert_bool(&mut interp, "Point.new(0, 0).is_a?(Point)", true);
    assert_bool(&mut interp, "Point.new(0, 0).is_a?(Object)", true);
    assert_bool(&mut interp, "Point.new(0, 0).is_a?(Integer)", false);
}

#[test]
fn test_reopening_a_class() {
    let mut interp = new_interp();
    eval(&mut interp, "class Thing; def a; 1; end; end");
    eval(&mut interp, "class Thing; def b; 2; end; end");
    assert_int(&mut interp, "t = Thing.new; t.a + t.b", 3);
    // reopening with the same superclass is fine
    eval(&mut interp, "class Sub < Thing; end; class Sub < Thing; def c; 3; end; end");
    assert_int(&mut interp, "Sub.new.c", 3);
    // a different superclass is not
    eval(&mut interp, "class Another; end");
    let err = eval_err(&mut interp, "class Sub < Another; end");
    assert_eq!(err.kind, "TypeError");
    assert!(err.message.contains("superclass mismatch"));
}

#[test]
fn test_inheritance_and_super() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "class A; def v; 1; end; end; class B < A; def v; super + 1; end; end; B.new.v",
        2,
    );
    // super with explicit arguments
    assert_int(
        &mut interp,
        "class C1; def f(x); x * 10; end; end; class C2 < C1; def f(x); super(x + 1); end; end; \
         C2.new.f(3)",
        40,
    );
    // bare super forwards the caller's parameters
    assert_int(
        &mut interp,
        "class D1; def g(x); x + 100; end; end; class D2 < D1; def g(x); super; end; end; \
         D2.new.g(5)",
        105,
    );
    let err = eval_err(
        &mut interp,
        "class Solo; def only; super; end; end; Solo.new.only",
    );
    assert_eq!(err.kind, "NoMethodError");
}

#[test]
fn test_include_order_most_recent_wins() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "module M; def v; 1; end; end; module N; def v; 2; end; end; \
         class C; include M; include N; end; C.new.v",
        2,
    );
}

#[test]
fn test_prepend_overrides_class() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "module P; def v; 10; end; end; class K; prepend P; def v; 1; end; end; K.new.v",
        10,
    );
}

#[test]
fn test_ancestors_reflection() {
    let mut interp = new_interp();
    eval(&mut interp, "module Mix; end; class Base; end; class Kid < Base; include Mix; end");
    let names = eval(&mut interp, "Kid.ancestors.map { |c| c.name }");
    let Value::Array(arr) = names else { panic!("expected array") };
    let names: Vec<String> = arr
        .borrow()
        .elems
        .iter()
        .map(|v| match v {
            Value::Str(s) => s.borrow().as_str_lossy().into_owned(),
            other => panic!("expected string, got {other:?}"),
        })
        .collect();
    assert_eq!(names, vec!["Kid", "Mix", "Base", "Object"]);
}

#[test]
fn test_dispatch_sees_mutations() {
    let mut interp = new_interp();
    eval(&mut interp, "class Mut; def v; 1; end; end; m = Mut.new");
    assert_int(&mut interp, "m.v", 1);
    eval(&mut interp, "class Mut; def v; 2; end; end");
    assert_int(&mut interp, "m.v", 2);
    eval(&mut interp, "module Late; def v; 3; end; end; class Mut; prepend Late; end");
    assert_int(&mut interp, "m.v", 3);
}

#[test]
fn test_attr_accessors() {
    let mut interp = new_interp();
    eval(
        &mut interp,
        "class Person; attr_accessor :name; attr_reader :age; \
         def initialize(n, a); @name = n; @age = a; end; end",
    );
    assert_str(&mut interp, "p1 = Person.new(\"ann\", 30); p1.name", "ann");
    assert_str(&mut interp, "p1.name = \"bob\"; p1.name", "bob");
    assert_int(&mut interp, "p1.age", 30);
    let err = eval_err(&mut interp, "p1.age = 40");
    assert_eq!(err.kind, "NoMethodError");
}

#[test]
fn test_instance_variables_are_per_object() {
    let mut interp = new_interp();
    eval(&mut interp, "class Box; attr_accessor :v; end");
    assert_int(&mut interp, "a = Box.new; b = Box.new; a.v = 1; b.v = 2; a.v + b.v * 10", 21);
    assert_nil(&mut interp, "Box.new.v");
}

#[test]
fn test_class_variables_shared_down_chain() {
    let mut interp = new_interp();
    eval(
        &mut interp,
        "class Counter; @@count = 0; \
         def self.bump; @@count = @@count + 1; end; \
         def self.count; @@count; end; end; \
         class SubCounter < Counter; end",
    );
    assert_int(&mut interp, "Counter.bump; SubCounter.bump; Counter.bump; Counter.count", 3);
    let err = eval_err(&mut interp, "class Fresh; def get; @@nope; end; end; Fresh.new.get");
    assert_eq!(err.kind, "NameError");
}

#[test]
fn test_singleton_methods() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "class Util; def self.answer; 42; end; end; Util.answer",
        42,
    );
    // class methods inherit through the metaclass chain
    assert_int(&mut interp, "class Util2 < Util; end; Util2.answer", 42);
    assert_int(
        &mut interp,
        "o = Object.new; o.define_singleton_method(:special) { 9 }; o.special",
        9,
    );
    let err = eval_err(&mut interp, "o2 = Object.new; o2.special");
    assert_eq!(err.kind, "NoMethodError");
}

#[test]
fn test_define_method() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "class Dyn; define_method(:double) { |x| x * 2 }; end; Dyn.new.double(4)",
        8,
    );
    // define_method closures capture their environment
    assert_int(
        &mut interp,
        "class Dyn2; end; scale = 3; Dyn2.define_method(:scaled) { |x| x * scale }; Dyn2.new.scaled(5)",
        15,
    );
}

#[test]
fn test_module_function_forms() {
    let mut interp = new_interp();
    // mode form
    assert_int(
        &mut interp,
        "module MathUtil; module_function; def triple(x); x * 3; end; end; MathUtil.triple(5)",
        15,
    );
    // list form
    assert_int(
        &mut interp,
        "module Helper; def assist; 42; end; module_function :assist; end; Helper.assist",
        42,
    );
}

#[test]
fn test_visibility() {
    let mut interp = new_interp();
    eval(
        &mut interp,
        "class Vault; def open_door; combo; end; private; def combo; 7; end; end",
    );
    // implicit self may call private methods
    assert_int(&mut interp, "Vault.new.open_door", 7);
    // explicit receivers may not
    let err = eval_err(&mut interp, "Vault.new.combo");
    assert_eq!(err.kind, "NoMethodError");
    assert!(err.message.contains("private"));
    // the reflective path bypasses visibility
    assert_int(&mut interp, "Vault.new.send(:combo)", 7);
    // list form
    eval(&mut interp, "class Vault2; def a; 1; end; def b; 2; end; private :b; end");
    assert_int(&mut interp, "Vault2.new.a", 1);
    let err = eval_err(&mut interp, "Vault2.new.b");
    assert_eq!(err.kind, "NoMethodError");
}

#[test]
fn test_method_missing() {
    let mut interp = new_interp();
    let out = eval(
        &mut interp,
        "class Ghost; def method_missing(name, *args); name; end; end; Ghost.new.whatever",
    );
    let Value::Symbol(sym) = out else { panic!("expected symbol, got {out:?}") };
    assert_eq!(interp.symbols.name_ref(sym), "whatever");
    assert_int(
        &mut interp,
        "class Echo; def method_missing(name, *args); args[0]; end; end; Echo.new.blah(42)",
        42,
    );
    // respond_to_missing? gates method_missing
    let err = eval_err(
        &mut interp,
        "class Picky; def respond_to_missing?(name, priv); name == :good; end; \
         def method_missing(name, *args); 1; end; end; Picky.new.bad",
    );
    assert_eq!(err.kind, "NoMethodError");
    assert_int(&mut interp, "Picky.new.good", 1);
}

#[test]
fn test_respond_to() {
    let mut interp = new_interp();
    assert_bool(&mut interp, "\"s\".respond_to?(:length)", true);
    assert_bool(&mut interp, "1.respond_to?(:push)", false);
    assert_bool(
        &mut interp,
        "class R1; def respond_to_missing?(name, priv); name == :magic; end; end; \
         R1.new.respond_to?(:magic)",
        true,
    );
}

#[test]
fn test_included_and_inherited_hooks() {
    let mut interp = new_interp();
    assert_bool(
        &mut interp,
        "module Tagger; def self.included(base); base.instance_variable_set(:@tagged, true); end; end; \
         class Target; include Tagger; end; Target.instance_variable_get(:@tagged)",
        true,
    );
    assert_int(
        &mut interp,
        "class Tracked; def self.inherited(sub); sub.instance_variable_set(:@gen, 1); end; end; \
         class Offspring < Tracked; end; Offspring.instance_variable_get(:@gen)",
        1,
    );
}

#[test]
fn test_extend_adds_singleton_methods() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "module Powers; def zap; 99; end; end; o = Object.new; o.extend(Powers); o.zap",
        99,
    );
    // other instances are unaffected
    let err = eval_err(&mut interp, "Object.new.zap");
    assert_eq!(err.kind, "NoMethodError");
}

#[test]
fn test_kwargs() {
    let mut interp = new_interp();
    assert_int(&mut interp, "def f(x:); x; end; f(x: 42)", 42);
    assert_int(&mut interp, "def fd(x: 10); x; end; fd()", 10);
    assert_int(&mut interp, "fd(x: 5)", 5);
    assert_int(&mut interp, "def f2(a:, b:); a + b; end; f2(a: 1, b: 2)", 3);
    assert_int(&mut interp, "def f3(x, y:); x + y; end; f3(1, y: 2)", 3);
    assert_int(&mut interp, "def f4(a:, b:); a - b; end; f4(b: 1, a: 10)", 9);
    assert_int(&mut interp, "def f5(x, y = 5, z:); x + y + z; end; f5(1, z: 10)", 16);
    assert_int(&mut interp, "def f6(a: 1, b: 2); a * b; end; f6(a: 10)", 20);
    assert_int(
        &mut interp,
        "class KC; def add(x:, y:); x + y; end; end; KC.new.add(x: 3, y: 7)",
        10,
    );
    let err = eval_err(&mut interp, "def f7(x:); x; end; f7()");
    assert_eq!(err.kind, "ArgumentError");
    assert!(err.message.contains("missing keyword"));
    let err = eval_err(&mut interp, "f7(y: 1, x: 2)");
    assert_eq!(err.kind, "ArgumentError");
    assert!(err.message.contains("unknown keyword"));
}

#[test]
fn test_freeze_and_frozen() {
    let mut interp = new_interp();
    let err = eval_err(&mut interp, "a = [1]; a.freeze; a.push(2)");
    assert_eq!(err.kind, "RuntimeError");
    assert!(err.message.contains("can't modify frozen"));
    assert_bool(&mut interp, "a.frozen?", true);
    assert_bool(&mut interp, "[1].frozen?", false);
    let err = eval_err(&mut interp, "h = {a: 1}; h.freeze; h[:b] = 2");
    assert!(err.message.contains("can't modify frozen"));
    let err = eval_err(
        &mut interp,
        "class FoB; attr_accessor :v; end; o = FoB.new; o.freeze; o.v = 1",
    );
    assert!(err.message.contains("can't modify frozen"));
}

#[test]
fn test_reflection_misc() {
    let mut interp = new_interp();
    assert_str(&mut interp, "1.class.name", "Integer");
    assert_str(&mut interp, "nil.class.name", "NilClass");
    assert_str(&mut interp, "\"s\".class.name", "String");
    assert_bool(&mut interp, "nil.nil?", true);
    assert_bool(&mut interp, "0.nil?", false);
    assert_str(&mut interp, "Integer.superclass.name", "Object");
    assert_nil(&mut interp, "Object.superclass");
    assert_int(&mut interp, "m = 5.method(:abs); m.call", 5);
    assert_bool(&mut interp, "String.method_defined?(:length)", true);
}

#[test]
fn test_current_method_name() {
    let mut interp = new_interp();
    let out = eval(&mut interp, "def who; __method__; end; who()");
    let Value::Symbol(sym) = out else { panic!("expected symbol") };
    assert_eq!(interp.symbols.name_ref(sym), "who");
    assert_nil(&mut interp, "__method__");
}

#[test]
fn test_operator_overloading() {
    let mut interp = new_interp();
    eval(
        &mut interp,
        "class Vec; attr_reader :x, :y; def initialize(x, y); @x = x; @y = y; end; \
         def +(o); Vec.new(x + o.x, y + o.y); end; \
         def ==(o); x == o.x && y == o.y; end; \
         def [](i); i == 0 ? x : y; end; end",
    );
    assert_int(&mut interp, "v = Vec.new(1, 2) + Vec.new(10, 20); v.x + v.y", 33);
    assert_bool(&mut interp, "Vec.new(1, 2) == Vec.new(1, 2)", true);
    assert_bool(&mut interp, "Vec.new(1, 2) == Vec.new(1, 3)", false);
    assert_int(&mut interp, "Vec.new(5, 6)[1]", 6);
}

#[test]
fn test_object_equality_and_identity() {
    let mut interp = new_interp();
    assert_bool(&mut interp, "o = Object.new; o == o", true);
    assert_bool(&mut interp, "Object.new == Object.new", false);
    assert_bool(&mut interp, "a = \"x\"; b = \"x\"; a == b", true);
    assert_bool(&mut interp, "a.equal?(b)", false);
    assert_bool(&mut interp, "a.equal?(a)", true);
}
