//! Fiber lifecycle, symmetric yield/resume value passing, nesting, and
//! interaction with budgets and iterators.

mod common;
use common::*;

#[test]
fn test_basic_resume() {
    let mut interp = new_interp();
    assert_int(&mut interp, "f = Fiber.new { 42 }; f.resume", 42);
    assert_int(&mut interp, "f = Fiber.new { 10 + 20 }; f.resume", 30);
}

#[test]
fn test_yield_suspends_with_value() {
    let mut interp = new_interp();
    assert_int(&mut interp, "f = Fiber.new { Fiber.yield(5); 10 }; f.resume", 5);
    assert_int(&mut interp, "f = Fiber.new { Fiber.yield(5); 10 }; f.resume; f.resume", 10);
    assert_int(
        &mut interp,
        "f = Fiber.new { Fiber.yield(1); Fiber.yield(2); 3 }; \
         a = f.resume; b = f.resume; c = f.resume; a + b * 10 + c * 100",
        321,
    );
}

#[test]
fn test_bidirectional_value_passing() {
    let mut interp = new_interp();
    assert_int(&mut interp, "f = Fiber.new { |x| x * 2 }; f.resume(21)", 42);
    assert_int(
        &mut interp,
        "f = Fiber.new { |x| v = Fiber.yield(x + 1); v * 2 }; f.resume(10); f.resume(20)",
        40,
    );
    assert_int(
        &mut interp,
        "f = Fiber.new { |x| a = Fiber.yield(x + 1); b = Fiber.yield(a + 1); b + 1 }; \
         r1 = f.resume(10); r2 = f.resume(r1 + 10); r3 = f.resume(r2 + 10); r3",
        33,
    );
}

#[test]
fn test_yield_without_value() {
    let mut interp = new_interp();
    assert_nil(&mut interp, "f = Fiber.new { Fiber.yield; 99 }; f.resume");
    assert_int(&mut interp, "f = Fiber.new { Fiber.yield; 99 }; f.resume; f.resume", 99);
}

#[test]
fn test_alive_tracks_lifecycle() {
    let mut interp = new_interp();
    assert_bool(&mut interp, "f = Fiber.new { Fiber.yield(1); 2 }; f.alive?", true);
    assert_bool(&mut interp, "f.resume; f.alive?", true);
    assert_bool(&mut interp, "f.resume; f.alive?", false);
}

#[test]
fn test_dead_fiber_resume_returns_nil() {
    let mut interp = new_interp();
    assert_nil(&mut interp, "f = Fiber.new { 42 }; f.resume; f.resume");
}

#[test]
fn test_yield_keyword_inside_fiber() {
    let mut interp = new_interp();
    assert_int(&mut interp, "f = Fiber.new { yield 5; 10 }; f.resume", 5);
    assert_int(&mut interp, "f = Fiber.new { yield 5; 10 }; f.resume; f.resume", 10);
}

#[test]
fn test_multiple_independent_fibers() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "f1 = Fiber.new { Fiber.yield(1); 2 }; f2 = Fiber.new { Fiber.yield(10); 20 }; \
         a = f1.resume; b = f2.resume; c = f1.resume; d = f2.resume; a + b + c + d",
        33,
    );
}

#[test]
fn test_fibonacci_generator() {
    let mut interp = new_interp();
    assert_ints(
        &mut interp,
        "fib = Fiber.new {\n\
           a = 0\n\
           b = 1\n\
           loop do\n\
             Fiber.yield(a)\n\
             t = a + b\n\
             a = b\n\
             b = t\n\
           end\n\
         }\n\
         out = []\n\
         8.times { out.push(fib.resume) }\n\
         out",
        &[0, 1, 1, 2, 3, 5, 8, 13],
    );
}

#[test]
fn test_nested_fibers() {
    let mut interp = new_interp();
    assert_int(
        &mut interp,
        "outer = Fiber.new {\n\
           inner = Fiber.new { Fiber.yield(1); 2 }\n\
           a = inner.resume\n\
           b = inner.resume\n\
           Fiber.yield(a + b)\n\
           99\n\
         }\n\
         outer.resume",
        3,
    );
    assert_int(&mut interp, "outer.resume", 99);
}

#[test]
fn test_yield_inside_bytecode_iterator_block() {
    let mut interp = new_interp();
    // the enumerable layer is bytecode, so user blocks may suspend the
    // fiber from inside it
    assert_ints(
        &mut interp,
        "f = Fiber.new { [1, 2, 3].each { |x| Fiber.yield(x * 10) }; -1 }\n\
         [f.resume, f.resume, f.resume, f.resume]",
        &[10, 20, 30, -1],
    );
}

#[test]
fn test_uncaught_error_propagates_to_parent() {
    let mut interp = new_interp();
    let err = eval_err(&mut interp, "f = Fiber.new { raise \"inside\" }; f.resume");
    assert_eq!(err.message, "inside");
    // the parent can rescue at the resume point
    assert_int(
        &mut interp,
        "f = Fiber.new { raise \"inside\" }; begin; f.resume; rescue => e; 7; end",
        7,
    );
    // the failed fiber is dead afterwards
    assert_bool(&mut interp, "g = Fiber.new { raise \"x\" }; begin; g.resume; rescue; end; g.alive?", false);
}

#[test]
fn test_yield_from_root_is_an_error() {
    let mut interp = new_interp();
    let err = eval_err(&mut interp, "Fiber.yield(1)");
    assert_eq!(err.kind, "RuntimeError");
    assert!(err.message.contains("root fiber"), "got: {}", err.message);
}

#[test]
fn test_double_resume_is_an_error() {
    let mut interp = new_interp();
    let err = eval_err(
        &mut interp,
        "f = nil; f = Fiber.new { f.resume; 1 }; f.resume",
    );
    assert_eq!(err.kind, "RuntimeError");
}

#[test]
fn test_fiber_state_survives_between_host_calls() {
    let mut interp = new_interp();
    eval(&mut interp, "gen = Fiber.new { Fiber.yield(1); Fiber.yield(2); 3 }");
    assert_int(&mut interp, "gen.resume", 1);
    assert_int(&mut interp, "gen.resume", 2);
    assert_int(&mut interp, "gen.resume", 3);
    assert_bool(&mut interp, "gen.alive?", false);
}
