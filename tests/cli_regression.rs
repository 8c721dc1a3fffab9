// Regression test: Ensure CLI errors are rendered with miette diagnostics
// Requires: assert_cmd, predicates crates in [dev-dependencies]

use std::fs;

use assert_cmd::Command;
use predicates::{prelude::PredicateBooleanExt, str::contains};

#[test]
fn pp_expands_and_prints_tokens() {
    let file = "tests/cli_pp_input.c";
    fs::write(file, "#define SQ(x) ((x) * (x))\nSQ(3)\n").unwrap();

    let mut cmd = Command::cargo_bin("mixpp").unwrap();
    cmd.arg("pp").arg(file);
    cmd.assert()
        .success()
        .stdout(contains("numeric_constant '3'").and(contains("punctuator '*'")));

    let _ = fs::remove_file(file);
}

#[test]
fn tokens_dumps_the_raw_stream() {
    let file = "tests/cli_tokens_input.c";
    fs::write(file, "#define A 1\nA ## B\n").unwrap();

    let mut cmd = Command::cargo_bin("mixpp").unwrap();
    cmd.arg("tokens").arg(file);
    cmd.assert().success().stdout(
        contains("hash '#'")
            .and(contains("identifier 'define'"))
            .and(contains("hashhash '##'")),
    );

    let _ = fs::remove_file(file);
}

#[test]
fn macros_lists_definitions_as_json() {
    let file = "tests/cli_macros_input.c";
    fs::write(file, "#define SQ(x) ((x) * (x))\n#define ONE 1\n").unwrap();

    let mut cmd = Command::cargo_bin("mixpp").unwrap();
    cmd.arg("macros").arg(file);
    cmd.assert().success().stdout(
        contains("\"name\": \"ONE\"")
            .and(contains("\"name\": \"SQ\""))
            .and(contains("\"function_like\": true")),
    );

    let _ = fs::remove_file(file);
}

#[test]
fn cli_reports_miette_diagnostics_on_error() {
    // An arity mismatch is a hard error and must fail the run.
    let bad_file = "tests/cli_bad_input.c";
    fs::write(bad_file, "#define TWO(a, b) a b\nTWO(1)\n").unwrap();

    let mut cmd = Command::cargo_bin("mixpp").unwrap();
    cmd.arg("pp").arg(bad_file);
    cmd.assert()
        .failure()
        .stderr(contains("mixpp::expand").or(contains("argument")));

    let _ = fs::remove_file(bad_file);
}

#[test]
fn missing_input_file_is_a_host_error() {
    let mut cmd = Command::cargo_bin("mixpp").unwrap();
    cmd.arg("pp").arg("tests/no_such_file.c");
    cmd.assert().failure().stderr(contains("cannot read"));
}
