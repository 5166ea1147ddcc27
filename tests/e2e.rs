use std::path::Path;
use std::process::Command;

use lirasm::method::CompiledArtifact;
use tempfile::TempDir;

const CALLS: &str = r#"{
    "name": "calls",
    "method_idx": 11,
    "instructions": [
        {"op": "label", "dex_pc": 0},
        {"op": "invoke-code", "opcode": 1, "dex_pc": 0, "target": 40, "invoke_type": "direct"},
        {"op": "load-word", "opcode": 2, "dex_pc": 3, "value": 1000},
        {"op": "invoke-method", "opcode": 3, "dex_pc": 5, "target": 41, "invoke_type": "virtual"},
        {"op": "export-pc", "dex_pc": 8},
        {"op": "label", "dex_pc": 8},
        {"op": "op", "opcode": 4, "dex_pc": 8}
    ],
    "catches": [8],
    "frame": {"num_regs": 4, "core_spill_mask": 3},
    "core_vmap": [65537],
    "references": [
        {"dex_pc": 0, "registers": [1]},
        {"dex_pc": 5, "registers": [1, 3]}
    ]
}"#;

const SWITCH: &str = r#"{
    "name": "switch",
    "method_idx": 12,
    "instructions": [
        {"op": "label", "dex_pc": 0},
        {"op": "switch", "opcode": 9, "dex_pc": 0, "table": 0},
        {"op": "label", "dex_pc": 4},
        {"op": "op", "opcode": 1, "dex_pc": 4},
        {"op": "label", "dex_pc": 6},
        {"op": "op", "opcode": 2, "dex_pc": 6}
    ],
    "switches": [
        {"kind": "sparse", "dex_pc": 0, "cases": [[10, 6], [20, 4]]}
    ],
    "frame": {"num_regs": 1}
}"#;

fn run_lirasm(dir: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_lirasm"))
        .current_dir(dir)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to execute lirasm");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn write(dir: &TempDir, name: &str, content: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn test_assemble_and_inspect() {
    let dir = TempDir::new().unwrap();
    let calls = write(&dir, "calls.json", CALLS);
    let switch = write(&dir, "switch.json", SWITCH);
    let out = dir.path().join("out");

    let (stdout, stderr, success) = run_lirasm(
        dir.path(),
        &["assemble", &calls, &switch, "-o", out.to_str().unwrap(), "--jobs", "2"],
    );
    assert!(success, "assemble should succeed, stderr:\n{}", stderr);
    assert!(stdout.contains("2 methods compiled, 2 patches recorded"), "{}", stdout);

    let artifact = CompiledArtifact::load(&out.join("calls.compiled.json")).unwrap();
    assert_eq!(artifact.method_idx, 11);
    assert_eq!(artifact.patches.len(), 2);
    assert!(artifact.diagnostics.is_empty());
    // 4 instructions, 1 word, 2 pointers
    assert_eq!(artifact.compiled.code.len(), 28);
    assert!(!artifact.compiled.gc_map.is_empty());

    let switch_artifact = CompiledArtifact::load(&out.join("switch.compiled.json")).unwrap();
    let code = &switch_artifact.compiled.code;
    // 3 instructions, then one sparse table at 12; anchor at 0 plus 4
    assert_eq!(code.len(), 12 + 16);
    let word = |at: usize| i32::from_le_bytes(code[at..at + 4].try_into().unwrap());
    assert_eq!((word(12), word(16)), (10, 8 - 4));
    assert_eq!((word(20), word(24)), (20, 4 - 4));

    let inspected = out.join("calls.compiled.json");
    let (stdout, stderr, success) = run_lirasm(dir.path(), &["inspect", inspected.to_str().unwrap()]);
    assert!(success, "inspect should succeed, stderr:\n{}", stderr);
    assert!(stdout.contains("method calls (#11)"), "{}", stdout);
    assert!(stdout.contains("pc2dex (2):"), "{}", stdout);
    assert!(stdout.contains("dex2pc (1):"), "{}", stdout);
    assert!(stdout.contains("vmap: [1, 65535]"), "{}", stdout);
}

#[test]
fn test_missing_reference_bitmap_fails() {
    let dir = TempDir::new().unwrap();
    let broken = CALLS.replace(r#"{"dex_pc": 5, "registers": [1, 3]}"#, r#"{"dex_pc": 6}"#);
    let path = write(&dir, "broken.json", &broken);
    let (_, stderr, success) = run_lirasm(dir.path(), &["assemble", &path]);
    assert!(!success);
    assert!(stderr.contains("missing reference bitmap for dex pc 0x5"), "{}", stderr);
}

#[test]
fn test_catch_diagnostics_reported() {
    let dir = TempDir::new().unwrap();
    let config = write(&dir, "strict.toml", "verify-tables = true\n");
    let extra = CALLS.replace(r#""catches": [8]"#, r#""catches": [8, 16]"#);
    let path = write(&dir, "calls.json", &extra);
    let (stdout, stderr, success) =
        run_lirasm(dir.path(), &["assemble", &path, "--config", &config]);
    assert!(success, "stderr:\n{}", stderr);
    assert!(stdout.contains("missing native PC for catch entry @ 0x10"), "{}", stdout);
}

#[test]
fn test_init_config() {
    let dir = TempDir::new().unwrap();
    let (stdout, _, success) = run_lirasm(dir.path(), &["init-config"]);
    assert!(success);
    assert!(stdout.contains("Created lirasm.toml"));
    let content = std::fs::read_to_string(dir.path().join("lirasm.toml")).unwrap();
    assert!(content.contains("instruction-set = \"thumb2\""), "{}", content);

    let (_, stderr, success) = run_lirasm(dir.path(), &["init-config"]);
    assert!(!success);
    assert!(stderr.contains("already exists"));
}

#[test]
fn test_invalid_json_reports_file() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "bad.json", "{ not json");
    let (_, stderr, success) = run_lirasm(dir.path(), &["assemble", &path]);
    assert!(!success);
    assert!(stderr.contains("bad.json"), "{}", stderr);
    assert!(stderr.contains("invalid method description"), "{}", stderr);
}

#[test]
fn test_methods_sharing_an_index_keep_their_own_patches() {
    let dir = TempDir::new().unwrap();
    let first = CALLS.replace(r#""method_idx": 11,"#, "");
    let second = first
        .replace(r#""name": "calls""#, r#""name": "other""#)
        .replace(r#""target": 41"#, r#""target": 77"#);
    let first = write(&dir, "first.json", &first);
    let second = write(&dir, "second.json", &second);

    let (stdout, stderr, success) = run_lirasm(dir.path(), &["assemble", &first, &second, "-j", "2"]);
    assert!(success, "stderr:\n{}", stderr);
    assert!(stdout.contains("2 methods compiled, 4 patches recorded"), "{}", stdout);

    let calls = CompiledArtifact::load(&dir.path().join("calls.compiled.json")).unwrap();
    let other = CompiledArtifact::load(&dir.path().join("other.compiled.json")).unwrap();
    assert_eq!(calls.method_idx, other.method_idx);
    assert_eq!(calls.patches.len(), 2);
    assert_eq!(other.patches.len(), 2);
    assert!(calls.patches.iter().any(|p| p.target_method_idx == 41));
    assert!(other.patches.iter().any(|p| p.target_method_idx == 77));
    assert!(!other.patches.iter().any(|p| p.target_method_idx == 41));
}

#[test]
fn test_method_name_cannot_leave_out_dir() {
    let dir = TempDir::new().unwrap();
    let escaping = CALLS.replace(r#""name": "calls""#, r#""name": "../escape""#);
    let path = write(&dir, "escape.json", &escaping);
    let out = dir.path().join("out");
    let (_, stderr, success) =
        run_lirasm(dir.path(), &["assemble", &path, "-o", out.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("is not a plain file name"), "{}", stderr);
    assert!(!dir.path().join("escape.compiled.json").exists());
}

#[test]
fn test_oversized_frame_fails_alone() {
    let dir = TempDir::new().unwrap();
    let huge = CALLS
        .replace(r#""name": "calls""#, r#""name": "huge""#)
        .replace(r#""num_regs": 4"#, r#""num_regs": 2147483647"#);
    let huge = write(&dir, "huge.json", &huge);
    let calls = write(&dir, "calls.json", CALLS);
    let (stdout, stderr, success) = run_lirasm(dir.path(), &["assemble", &huge, &calls, "-j", "1"]);
    assert!(!success);
    assert!(stderr.contains("frame size"), "{}", stderr);
    assert!(stdout.contains("1 methods compiled"), "{}", stdout);
    assert!(dir.path().join("calls.compiled.json").exists());
}
