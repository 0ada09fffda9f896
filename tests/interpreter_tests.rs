// Integration tests driving the full reader -> compiler -> VM pipeline.
//
// Tests cover: arithmetic and comparisons, `let`/`lambda`/`define`,
// recursion through proper tail calls, closures over `let`-bound and
// parameter variables, `call/cc`, `quote`, and the documented error kinds.

use picoscheme::compiler::Compiler;
use picoscheme::host::HostEnv;
use picoscheme::reader::read_program;
use picoscheme::value::Value;
use picoscheme::vm::VM;

fn run_source(source: &str) -> Value {
    let forms = read_program(source).expect("reader failed");
    let pool = Compiler::compile_keep_last(&forms).expect("compile failed");
    let mut vm = VM::new(pool, HostEnv::prelude()).expect("vm construction failed");
    vm.start().expect("vm execution failed")
}

#[test]
fn arithmetic_is_left_to_right_and_promotes_to_float_on_division() {
    assert_eq!(run_source("(+ 1 2)"), Value::Integer(3));
    assert_eq!(run_source("(* 3 4)"), Value::Integer(12));
    assert_eq!(run_source("(/ 6 3)"), Value::Float(2.0));
    assert_eq!(run_source("(- 10 (* 2 3))"), Value::Integer(4));
}

#[test]
fn comparisons_encode_false_as_nil_and_true_as_one() {
    assert_eq!(run_source("(= 3 3)"), Value::Integer(1));
    assert_eq!(run_source("(= 3 4)"), Value::Nil);
    assert_eq!(run_source("(> 5 2)"), Value::Integer(1));
}

#[test]
fn if_only_nil_is_false() {
    assert_eq!(run_source("(if 0 1 2)"), Value::Integer(1));
    assert_eq!(run_source("(if \"\" 1 2)"), Value::Integer(1));
    assert_eq!(run_source("(if (= 1 2) 1 2)"), Value::Integer(2));
}

#[test]
fn let_binds_a_scoped_local() {
    assert_eq!(run_source("(let ((x 5) (y 6)) (+ x y))"), Value::Integer(11));
}

#[test]
fn lambda_application_and_multiple_body_expressions() {
    assert_eq!(run_source("(define add (lambda (x y) (+ x y))) (add 2 3)"), Value::Integer(5));
    assert_eq!(run_source("(define f (lambda (x) (+ x 1) (+ x 2))) (f 10)"), Value::Integer(12));
}

#[test]
fn define_with_argument_list_desugars_to_a_lambda() {
    assert_eq!(run_source("(define (square x) (* x x)) (square 7)"), Value::Integer(49));
}

#[test]
fn recursive_define_can_reference_itself() {
    let source = "
        (define (fact n)
          (if (= n 0) 1 (* n (fact (- n 1)))))
        (fact 10)
    ";
    assert_eq!(run_source(source), Value::Integer(3628800));
}

#[test]
fn deep_tail_recursion_does_not_overflow_the_rust_stack() {
    let source = "
        (define (count n acc)
          (if (= n 0) acc (count (- n 1) (+ acc 1))))
        (count 200000 0)
    ";
    assert_eq!(run_source(source), Value::Integer(200000));
}

#[test]
fn closures_capture_an_enclosing_parameter() {
    let source = "
        (define (make-adder n)
          (lambda (x) (+ x n)))
        (define add5 (make-adder 5))
        (add5 10)
    ";
    assert_eq!(run_source(source), Value::Integer(15));
}

#[test]
fn closures_capture_a_let_bound_variable_across_two_function_boundaries() {
    let source = "
        (let ((n 100))
          (begin
            (define outer (lambda () (define inner (lambda () n)) (inner)))
            (outer)))
    ";
    assert_eq!(run_source(source), Value::Integer(100));
}

#[test]
fn variadic_lambda_collects_extra_arguments_into_a_list() {
    let source = "
        (define (first-of . args) (car args))
        (first-of 1 2 3)
    ";
    assert_eq!(run_source(source), Value::Integer(1));
}

#[test]
fn cons_car_cdr_build_and_tear_down_pairs() {
    assert_eq!(run_source("(car (cons 1 2))"), Value::Integer(1));
    assert_eq!(run_source("(cdr (cons 1 2))"), Value::Integer(2));
}

#[test]
fn quote_yields_an_unevaluated_list_of_symbols() {
    let result = run_source("'(a b c)");
    assert_eq!(result, Value::list_from(&[Value::symbol("a"), Value::symbol("b"), Value::symbol("c")]));
}

#[test]
fn call_cc_escapes_early_from_a_computation() {
    let source = "
        (+ 1 (call/cc (lambda (k) (k 10) 999)))
    ";
    assert_eq!(run_source(source), Value::Integer(11));
}

#[test]
fn begin_sequences_and_discards_all_but_the_last_value() {
    assert_eq!(run_source("(begin 1 2 3)"), Value::Integer(3));
}

#[test]
fn unbound_global_is_a_runtime_error() {
    let forms = read_program("undefined-name").unwrap();
    let pool = Compiler::compile_keep_last(&forms).unwrap();
    let mut vm = VM::new(pool, HostEnv::prelude()).unwrap();
    assert!(vm.start().is_err());
}

#[test]
fn duplicate_let_binding_is_a_compile_error() {
    let forms = read_program("(let ((x 1) (x 2)) x)").unwrap();
    assert!(Compiler::compile(&forms).is_err());
}

#[test]
fn wrong_arity_call_is_a_runtime_error() {
    let source = "(define (f x) x) (f 1 2)";
    let forms = read_program(source).unwrap();
    let pool = Compiler::compile_keep_last(&forms).unwrap();
    let mut vm = VM::new(pool, HostEnv::prelude()).unwrap();
    assert!(vm.start().is_err());
}

#[test]
fn assert_host_function_checks_equality() {
    assert_eq!(run_source("(assert 1 1)"), Value::Undefined);
}

#[test]
fn multi_form_program_pops_display_and_assert_without_underflowing() {
    let source = "
        (display 1)
        (assert 1 1)
        (display 2)
        (assert 2 2)
    ";
    let forms = read_program(source).unwrap();
    let pool = Compiler::compile(&forms).expect("compile failed");
    let mut vm = VM::new(pool, HostEnv::prelude()).expect("vm construction failed");
    assert!(vm.start().is_ok());
}

#[test]
fn not_inverts_truthiness() {
    assert_eq!(run_source("(not 0)"), Value::Nil);
    assert_eq!(run_source("(not '())"), Value::Integer(1));
}
