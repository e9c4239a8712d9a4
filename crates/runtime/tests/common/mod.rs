//! Shared harness for the integration suites: a fresh interpreter with
//! the kernel open, plus typed evaluation helpers.
#![allow(dead_code)]

use ruse_runtime::{Config, ErrorInfo, Interp, Value};

pub fn new_interp() -> Interp {
    let mut interp = Interp::new(Config::default());
    interp.open_base().expect("open_base");
    interp
}

pub fn eval(interp: &mut Interp, source: &str) -> Value {
    match interp.eval(source, "<test>") {
        Ok(value) => value,
        Err(err) => panic!("eval failed: {err}\nsource: {source}"),
    }
}

pub fn eval_err(interp: &mut Interp, source: &str) -> ErrorInfo {
    match interp.eval(source, "<test>") {
        Ok(value) => panic!("expected an error, got {value:?}\nsource: {source}"),
        Err(err) => err,
    }
}

#[track_caller]
pub fn assert_int(interp: &mut Interp, source: &str, expected: i64) {
    match eval(interp, source) {
        Value::Int(v) => assert_eq!(v, expected, "source: {source}"),
        other => panic!("expected Int({expected}), got {other:?}\nsource: {source}"),
    }
}

#[track_caller]
pub fn assert_str(interp: &mut Interp, source: &str, expected: &str) {
    match eval(interp, source) {
        Value::Str(s) => {
            assert_eq!(s.borrow().as_str_lossy(), expected, "source: {source}");
        }
        other => panic!("expected string {expected:?}, got {other:?}\nsource: {source}"),
    }
}

#[track_caller]
pub fn assert_bool(interp: &mut Interp, source: &str, expected: bool) {
    match eval(interp, source) {
        Value::Bool(v) => assert_eq!(v, expected, "source: {source}"),
        other => panic!("expected Bool({expected}), got {other:?}\nsource: {source}"),
    }
}

#[track_caller]
pub fn assert_nil(interp: &mut Interp, source: &str) {
    match eval(interp, source) {
        Value::Nil => {}
        other => panic!("expected nil, got {other:?}\nsource: {source}"),
    }
}

#[track_caller]
pub fn assert_ints(interp: &mut Interp, source: &str, expected: &[i64]) {
    match eval(interp, source) {
        Value::Array(arr) => {
            let got: Vec<i64> = arr
                .borrow()
                .elems
                .iter()
                .map(|v| match v {
                    Value::Int(i) => *i,
                    other => panic!("non-int element {other:?}\nsource: {source}"),
                })
                .collect();
            assert_eq!(got, expected, "source: {source}");
        }
        other => panic!("expected an Array, got {other:?}\nsource: {source}"),
    }
}
