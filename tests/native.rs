//! Protected executables run on the host CPU.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, ExitStatus};
use std::thread;
use std::time::Duration;

use common::*;

const SEED: u64 = 0xC0DE;
const ETXTBSY: i32 = 26;

/// Runs `path`, retrying while a concurrently forked test still holds the file
/// open for writing.
fn run(path: &Path) -> ExitStatus {
    for _ in 0..50 {
        match Command::new(path).status() {
            Err(err) if err.raw_os_error() == Some(ETXTBSY) => thread::sleep(Duration::from_millis(20)),
            other => return other.expect("runs"),
        }
    }
    panic!("{} stayed busy", path.display());
}

fn exit_code(image: &[u8], dir: &Path, name: &str) -> i32 {
    let path = dir.join(name);
    fs::write(&path, image).expect("writes");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    run(&path).code().expect("exits normally")
}

/// Builds `_start` calling `f(a, b)` followed by `functions`, runs the image before
/// and after protecting `selected`, and returns both exit codes.
fn before_and_after(functions: &[(&str, &[u8])], selected: &[&str], a: u32, b: u32) -> (i32, i32) {
    // `_start` is 24 bytes, so the first function lands 32 bytes in.
    let target = ELF_TEXT + 32;
    let entry = start(ELF_TEXT, target, a, b);
    let mut all = vec![("_start", entry.as_slice())];
    all.extend_from_slice(functions);
    assert_eq!(addresses(&all, ELF_TEXT)[1], target);
    let input = elf64(&all);

    let (result, _, summary, _) = protect(input.clone(), virtualize(selected), SEED);
    let output = result.expect("protects");
    assert_eq!(summary.virtualized, selected.len());

    let dir = tempfile::tempdir().expect("scratch dir");
    (exit_code(&input, dir.path(), "plain"), exit_code(&output, dir.path(), "protected"))
}

#[test]
fn straight_line_arithmetic() {
    assert_eq!(before_and_after(&[("f", ADD)], &["f"], 40, 2), (42, 42));
}

#[test]
fn conditional_branch() {
    assert_eq!(before_and_after(&[("f", MAX)], &["f"], 3, 9), (9, 9));
    assert_eq!(before_and_after(&[("f", MAX)], &["f"], 77, 5), (77, 77));
}

#[test]
fn loop_with_a_counter() {
    assert_eq!(before_and_after(&[("f", SUM)], &["f"], 10, 0), (55, 55));
    assert_eq!(before_and_after(&[("f", SUM)], &["f"], 0, 0), (0, 0));
}

#[test]
fn call_out_and_back() {
    let f = ELF_TEXT + 32;
    let h = f + 16;
    let c = call_out(f, h);
    // c(x) = double(x) + x
    assert_eq!(before_and_after(&[("f", c.as_slice()), ("h", DOUBLE)], &["f"], 7, 0), (21, 21));
}
