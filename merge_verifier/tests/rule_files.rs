use std::fs;
use std::path::{Path, PathBuf};

use merge_verifier::verification::Verifications;
use tempfile::{tempdir, TempDir};

fn write(dir: &TempDir, file: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(file);
    fs::write(&path, contents).unwrap();
    path
}

fn rule(name: &str) -> String {
    format!(
        r#"
        [[verification]]
        name = "{name}"
        layer = "Beacon"
        check_delay_seconds = 12
        metric = "SlotBlock"
        aggregate_function = "Count"
        pass_criteria = "MinimumValue"
        pass_value = 1
        "#
    )
}

#[test]
fn defaults_are_used_without_files() {
    let loaded = Verifications::load(None, &[] as &[&Path]).unwrap();
    assert_eq!(loaded, Verifications::defaults());
    assert!(!loaded.is_empty());
}

#[test]
fn overrides_replace_and_extras_append() {
    let dir = tempdir().unwrap();
    let overrides = write(&dir, "overrides.toml", &rule("Only Blocks"));
    let first = write(&dir, "first.toml", &rule("First Extra"));
    let second = write(&dir, "second.toml", &(rule("Second Extra") + &rule("Third Extra")));

    let loaded = Verifications::load(Some(overrides.as_path()), &[first.clone(), second]).unwrap();
    assert_eq!(
        loaded.names(),
        ["Only Blocks", "First Extra", "Second Extra", "Third Extra"]
    );

    let appended = Verifications::load(None, &[first]).unwrap();
    assert_eq!(appended.len(), Verifications::defaults().len() + 1);
    assert_eq!(appended.names().last(), Some(&"First Extra"));
}

#[test]
fn broken_files_name_the_path() {
    let dir = tempdir().unwrap();
    let broken = write(&dir, "broken.toml", "[[verification]]\nname = 3\n");
    let missing = dir.path().join("missing.toml");

    let err = Verifications::load(Some(broken.as_path()), &[] as &[&Path]).unwrap_err();
    assert!(format!("{err:#}").contains("broken.toml"));

    let err = Verifications::load(None, &[missing]).unwrap_err();
    assert!(format!("{err:#}").contains("missing.toml"));
}
