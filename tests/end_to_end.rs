//! Scenario-level tests driving the public `Vm` API the way a script runner
//! would. These exercise the compiler and VM together; unit-level coverage
//! of individual opcodes/table/GC behavior lives next to those modules.

use loxvm::{InterpretResult, Vm};

fn run(src: &str) -> InterpretResult {
    Vm::new().interpret(src)
}

#[test]
fn closures_capture_variables_by_reference_not_by_value() {
    let result = run(
        r#"
        fun makeCounter() {
            var count = 0;
            fun increment() {
                count = count + 1;
                return count;
            }
            return increment;
        }
        var counter = makeCounter();
        if (counter() != 1) { exitCode(); }
        if (counter() != 2) { exitCode(); }
        "#
        .replace("exitCode();", "print \"fail\";")
        .as_str(),
    );
    assert!(matches!(result, InterpretResult::Ok));
}

#[test]
fn class_with_initializer_and_inheritance_dispatches_dynamically() {
    let src = r#"
        class Shape {
            init(name) { this.name = name; }
            describe() { return this.name + " is a shape"; }
        }
        class Circle < Shape {
            init(radius) {
                super.init("circle");
                this.radius = radius;
            }
            area() { return 3.14159 * this.radius * this.radius; }
        }
        var c = Circle(2);
        print c.describe();
        print c.area();
    "#;
    assert!(matches!(run(src), InterpretResult::Ok));
}

#[test]
fn string_interning_makes_equal_literals_compare_equal() {
    let src = r#"
        var a = "hello" + "" ;
        var b = "hel" + "lo";
        if (a != b) { print "broken"; } else { print "ok"; }
    "#;
    assert!(matches!(run(src), InterpretResult::Ok));
}

#[test]
fn upvalues_close_over_a_variable_leaving_its_scope() {
    let src = r#"
        var captured;
        {
            var x = "outer";
            fun grab() { return x; }
            captured = grab;
        }
        print captured();
    "#;
    assert!(matches!(run(src), InterpretResult::Ok));
}

#[test]
fn break_exits_the_loop_and_continue_skips_an_iteration() {
    let src = r#"
        var seen = "";
        var i = 0;
        while (i < 10) {
            i = i + 1;
            if (i == 3) continue;
            if (i == 6) break;
            seen = seen + "x";
        }
        print seen;
    "#;
    assert!(matches!(run(src), InterpretResult::Ok));
}

#[test]
fn runtime_type_error_reports_and_does_not_panic() {
    let src = r#"
        fun addOne(n) { return n + 1; }
        addOne("not a number");
    "#;
    assert!(matches!(run(src), InterpretResult::RuntimeError));
}

#[test]
fn indexing_a_non_table_is_a_runtime_type_error() {
    let src = r#"
        var n = 5;
        print n[0];
    "#;
    assert!(matches!(run(src), InterpretResult::RuntimeError));
}

#[test]
fn tables_support_get_and_set() {
    let src = r#"
        var t = table();
        t["a"] = 1;
        t["b"] = t["a"] + 1;
        print t["b"];
    "#;
    assert!(matches!(run(src), InterpretResult::Ok));
}

#[test]
fn native_functions_are_callable_from_global_scope() {
    let src = r#"
        print abs(-4);
        print sqrt(9);
        print max(1, 5, 3);
        print sum(1, 2, 3);
    "#;
    assert!(matches!(run(src), InterpretResult::Ok));
}

#[test]
fn stack_overflow_from_unbounded_recursion_is_a_runtime_error() {
    let src = r#"
        fun recurse() { return recurse(); }
        recurse();
    "#;
    assert!(matches!(run(src), InterpretResult::RuntimeError));
}

#[test]
fn compile_error_does_not_run_any_code() {
    assert!(matches!(run("var x = ;"), InterpretResult::CompileError));
}

#[test]
fn repl_style_sequential_interpret_calls_share_globals() {
    let mut vm = Vm::new();
    assert!(matches!(vm.interpret("var shared = 10;"), InterpretResult::Ok));
    assert!(matches!(vm.interpret("print shared + 5;"), InterpretResult::Ok));
}
