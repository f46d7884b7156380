// Integration tests for the Canidae interpreter
//
// These tests run complete Canidae programs through the public library API
// and check printed output, error reports, and exit classification. Tests
// cover:
// - Arrays, strings, and indexing
// - Functions, closures, and recursion
// - Classes, inheritance, and super dispatch
// - Exceptions and try/catch
// - Imports (including nested and cyclic)

use canidae::compiler::compile;
use canidae::errors::{CompileError, RuntimeReport};
use canidae::vm::Vm;
use pretty_assertions::assert_eq;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A unique scratch directory per test, for import fixtures.
fn scratch_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let dir = std::env::temp_dir().join(format!(
        "canidae_test_{}_{}_{}",
        prefix,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&dir).expect("failed to create scratch dir");
    dir
}

fn run_in_dir(source: &str, dir: Option<PathBuf>) -> (Result<(), RuntimeReport>, Vec<String>) {
    let function =
        compile(source, dir.map(Rc::new)).expect("source should compile");
    let mut vm = Vm::with_capture();
    let result = vm.interpret(function);
    let output = vm.take_print_output();
    (result, output)
}

fn run(source: &str) -> (Result<(), RuntimeReport>, Vec<String>) {
    run_in_dir(source, None)
}

fn run_ok(source: &str) -> Vec<String> {
    let (result, output) = run(source);
    if let Err(report) = result {
        panic!("unexpected runtime error:\n{}", report);
    }
    output
}

fn compile_err(source: &str) -> Vec<CompileError> {
    compile(source, None).expect_err("expected a compile error")
}

// === Scenarios pinned by the language's behavioral surface ===

#[test]
fn array_literals_print_and_concatenate() {
    let output = run_ok("print [1,2,3];\nprint [1,2,3] + [4,5,6];");
    assert_eq!(output, vec!["[1, 2, 3]", "[1, 2, 3, 4, 5, 6]"]);
}

#[test]
fn mixed_addition_fails_at_runtime() {
    let (result, _) = run("print 1 + \"a\";");
    let report = result.expect_err("expected runtime error");
    assert!(report.first_line.contains("Unsupported operands for binary operation"));
    assert!(report.to_string().contains("[line 1] in script"));
}

#[test]
fn recursive_fibonacci() {
    let output = run_ok(
        r#"
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        print fib(20);
        "#,
    );
    assert_eq!(output, vec!["6765"]);
}

#[test]
fn array_out_of_range_report_shape() {
    let (result, _) = run("var a = [1,2,3];\nprint a[3];");
    let report = result.expect_err("expected runtime error");
    let rendered = report.to_string();
    let lines: Vec<&str> = rendered.lines().collect();
    assert_eq!(lines[0], "Array index 3 exceeds max index of array (2).");
    assert!(lines[1].starts_with("[line 2]"));
}

#[test]
fn try_catch_without_types_catches_everything() {
    let output = run_ok("try { raise \"boom\"; } catch { print \"Caught\"; } end");
    assert_eq!(output, vec!["Caught"]);
}

#[test]
fn shared_upvalue_between_sibling_closures() {
    let output = run_ok(
        r#"
        fun make_counter() {
            var count = 0;
            fun increment() {
                count = count + 1;
            }
            fun read() {
                return count;
            }
            return [increment, read];
        }
        var pair = make_counter();
        var bump = pair[0];
        var read = pair[1];
        bump();
        print read();
        "#,
    );
    assert_eq!(output, vec!["1"]);
}

#[test]
fn super_invokes_parent_method_on_receiver() {
    let output = run_ok(
        r#"
        class A {
            greet() {
                print "hi";
            }
        }
        class B : A {
            greet() {
                super.greet();
                print "bye";
            }
        }
        B().greet();
        "#,
    );
    assert_eq!(output, vec!["hi", "bye"]);
}

#[test]
fn while_without_condition_is_a_compile_error() {
    let errors = compile_err("while do print 1; end");
    assert_eq!(errors[0].to_string(), "[line 1] Error at 'do': Expect expression.");
}

// === Quantified properties ===

#[test]
fn string_indexing_covers_the_full_valid_range() {
    let source = r#"
        var s = "canid";
        for (var i = -5; i < 5; i = i + 1) {
            print s[i];
        }
    "#;
    let output = run_ok(source);
    assert_eq!(output, vec!["c", "a", "n", "i", "d", "c", "a", "n", "i", "d"]);
}

#[test]
fn array_set_then_get_yields_the_value() {
    let output = run_ok(
        r#"
        var a = [1, 2, 3];
        for (var i = 0; i < 3; i = i + 1) {
            a[i] = i * 10;
            print a[i];
        }
        "#,
    );
    assert_eq!(output, vec!["0", "10", "20"]);
}

#[test]
fn method_access_produces_a_bound_method() {
    let output = run_ok(
        r#"
        class Named {
            init(name) {
                this.name = name;
            }
            whoami() {
                return this.name;
            }
        }
        var a = Named("alpha");
        var b = Named("beta");
        var m = a.whoami;
        print m();
        print b.whoami();
        "#,
    );
    assert_eq!(output, vec!["alpha", "beta"]);
}

#[test]
fn raise_unwinds_to_matching_handler_by_ancestry() {
    let output = run_ok(
        r#"
        fun thrower() {
            raise TypeError("t");
        }
        try {
            try {
                thrower();
            } catch (IndexError) {
                print "wrong handler";
            } end
        } catch (Error as e) {
            print "caught " + e.message;
        } end
        "#,
    );
    assert_eq!(output, vec!["caught t"]);
}

#[test]
fn uncaught_exception_reports_raised_at_with_frames() {
    let (result, _) = run(
        "fun inner() {\n    raise \"deep\";\n}\nfun outer() {\n    inner();\n}\nouter();",
    );
    let report = result.expect_err("expected runtime error").to_string();
    let lines: Vec<&str> = report.lines().collect();
    assert_eq!(lines[0], "deep");
    assert_eq!(lines[1], "Raised at:");
    assert_eq!(lines[2], "\t[line 2] in inner()");
    assert_eq!(lines[3], "\t[line 5] in outer()");
    assert_eq!(lines[4], "\t[line 7] in script");
}

// === Loops ===

#[test]
fn all_three_loop_forms_agree() {
    let output = run_ok(
        r#"
        var i = 0;
        while i < 3 do
            print i;
            i = i + 1;
        end
        var j = 0;
        do
            print j;
            j = j + 1;
        while j < 3 end
        for (var k = 0; k < 3; k = k + 1) {
            print k;
        }
        "#,
    );
    assert_eq!(output, vec!["0", "1", "2", "0", "1", "2", "0", "1", "2"]);
}

#[test]
fn multiline_strings_print_verbatim() {
    let output = run_ok("print \"Hello,\nWorld\";");
    assert_eq!(output, vec!["Hello,\nWorld"]);
}

// === Imports ===

#[test]
fn import_binds_declarations_and_module_instance() {
    let dir = scratch_dir("import_basic");
    fs::write(
        dir.join("point.can"),
        r#"
        class Point {
            init(x, y) {
                this.x = x;
                this.y = y;
            }
            show() {
                print "(" + str(this.x) + ", " + str(this.y) + ")";
            }
        }
        var origin = Point(0, 0);
        "#,
    )
    .unwrap();

    let (result, output) = run_in_dir(
        r#"
        import point;
        var p = Point(1, 2);
        p.show();
        print point;
        "#,
        Some(dir),
    );
    assert!(result.is_ok());
    assert_eq!(output, vec!["(1, 2)", "<point>"]);
}

#[test]
fn nested_imports_resolve_relative_to_each_file() {
    let dir = scratch_dir("import_nested");
    fs::write(dir.join("constants.can"), "var pi = 3.14159;\n").unwrap();
    fs::write(
        dir.join("circle.can"),
        "import constants;\nfun circumference(r) {\n    return 2 * pi * r;\n}\n",
    )
    .unwrap();

    let (result, output) = run_in_dir(
        "import circle;\nprint pi;\nprint circumference(1) > 6;",
        Some(dir),
    );
    assert!(result.is_ok());
    assert!(output[0].starts_with("3.14159"));
    assert_eq!(output[1], "true");
}

#[test]
fn modules_execute_once_per_path() {
    let dir = scratch_dir("import_once");
    fs::write(dir.join("noisy.can"), "print \"module ran\";\n").unwrap();

    let output_src = "import noisy;\nimport noisy;\n";
    let (result, output) = run_in_dir(output_src, Some(dir));
    assert!(result.is_ok());
    assert_eq!(output, vec!["module ran"]);
}

#[test]
fn cyclic_imports_terminate() {
    let dir = scratch_dir("import_cycle");
    fs::write(dir.join("alpha.can"), "import beta;\nvar from_alpha = 1;\n").unwrap();
    fs::write(dir.join("beta.can"), "import alpha;\nvar from_beta = 2;\n").unwrap();

    let (result, output) = run_in_dir(
        "import alpha;\nprint from_alpha + from_beta;",
        Some(dir),
    );
    assert!(result.is_ok());
    assert_eq!(output, vec!["3"]);
}

#[test]
fn missing_import_reports_file_and_line() {
    let (result, _) = run("import missing_module_for_tests;");
    let report = result.expect_err("expected runtime error");
    assert!(report.first_line.starts_with("Could not open file"));
    let rendered = report.to_string();
    assert!(rendered.lines().nth(1).unwrap().starts_with("[line 1]"));
}

// === Error class coverage ===

#[test]
fn vm_errors_are_catchable_by_builtin_type() {
    let output = run_ok(
        r#"
        fun attempt(f) {
            try {
                f();
                print "no error";
            } catch (Error as e) {
                print e.type;
            } end
        }
        fun index_error() {
            var a = [];
            return a[0];
        }
        fun type_error() {
            return 1 + "x";
        }
        attempt(index_error);
        attempt(type_error);
        "#,
    );
    assert_eq!(output, vec!["<errortype IndexError>", "<errortype TypeError>"]);
}

#[test]
fn compile_error_list_reports_each_statement() {
    let errors = compile_err("print ;\nvar = 5;");
    assert!(errors.len() >= 2);
    assert!(errors[0].to_string().contains("Expect expression."));
    assert!(errors[1].to_string().contains("Expect variable name."));
}
