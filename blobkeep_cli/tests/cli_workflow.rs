use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn run_cli(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_blobkeep"))
        .arg("--config")
        .arg(config)
        .arg("-q")
        .args(args)
        .output()
        .expect("failed to execute process")
}

fn stdout_of(output: &Output) -> String {
    if !output.status.success() {
        eprintln!("command failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    assert!(output.status.success());
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn put_get_delete_and_gc() -> anyhow::Result<()> {
    // 1. Setup
    let base = tempfile::tempdir()?;
    let config = base.path().join("config.toml");
    let store_path = base.path().join("store");
    let cache_path = base.path().join("cache");
    fs::write(
        &config,
        format!(
            r#"[provider.default]
type = "local"
path = "{}"

[provider.cached]
type = "local"
path = "{}"

[provider.cached.cache]
dir = "{}"
"#,
            store_path.display(),
            base.path().join("cached_store").display(),
            cache_path.display(),
        ),
    )?;
    let input = base.path().join("hello.txt");
    fs::write(&input, "hello")?;

    // 2. Put prints the prefixed key
    let key = stdout_of(&run_cli(&config, &["put", input.to_str().unwrap()]));
    let key = key.trim();
    assert_eq!(key, "default:5d41402abc4b2a76b9719d911017c592");
    assert!(store_path.join("data/5d41402abc4b2a76b9719d911017c592").exists());

    // 3. Get writes the bytes back
    let out = base.path().join("out.txt");
    stdout_of(&run_cli(&config, &["get", key, "--out", out.to_str().unwrap()]));
    assert_eq!(fs::read_to_string(&out)?, "hello");

    // 4. A dry-run gc deletes nothing
    let keep = base.path().join("keep.txt");
    fs::write(&keep, format!("{key}\n"))?;
    let report = stdout_of(&run_cli(
        &config,
        &["gc", "--keep-file", keep.to_str().unwrap(), "--dry-run"],
    ));
    assert!(report.contains("kept 1 blobs"), "{report}");
    assert!(store_path.join("data/5d41402abc4b2a76b9719d911017c592").exists());

    // 5. Cache maintenance only exists on cached providers
    let report = stdout_of(&run_cli(&config, &["cache-clear", "--provider", "cached"]));
    assert!(report.contains("deleted 0 files"), "{report}");
    assert!(!run_cli(&config, &["cache-clear"]).status.success());

    // 6. Delete, then the key is gone
    stdout_of(&run_cli(&config, &["delete", key]));
    let missing = run_cli(&config, &["get", key, "--out", out.to_str().unwrap()]);
    assert!(!missing.status.success());
    Ok(())
}

#[test]
fn config_init_and_add_local() -> anyhow::Result<()> {
    let base = tempfile::tempdir()?;
    let config = base.path().join("nested").join("config.toml");

    stdout_of(&run_cli(&config, &["config", "init"]));
    stdout_of(&run_cli(
        &config,
        &[
            "config",
            "add-local",
            "archive",
            base.path().join("archive").to_str().unwrap(),
            "--digest",
            "SHA-256",
        ],
    ));
    let content = fs::read_to_string(&config)?;
    assert!(content.contains("[provider.default]"), "{content}");
    assert!(content.contains("[provider.archive]"), "{content}");
    assert!(content.contains("SHA-256"), "{content}");

    // adding the same provider twice fails and leaves the file alone
    let again = run_cli(&config, &["config", "add-local", "archive", "/elsewhere"]);
    assert!(!again.status.success());
    assert_eq!(fs::read_to_string(&config)?, content);

    let input = base.path().join("hello.txt");
    fs::write(&input, "hello")?;
    let key = stdout_of(&run_cli(
        &config,
        &["put", "--provider", "archive", input.to_str().unwrap()],
    ));
    assert_eq!(
        key.trim(),
        "archive:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    Ok(())
}

#[test]
fn add_local_rejects_unknown_digest() -> anyhow::Result<()> {
    let base = tempfile::tempdir()?;
    let config = base.path().join("config.toml");
    stdout_of(&run_cli(&config, &["config", "init"]));
    let content = fs::read_to_string(&config)?;

    let bad = run_cli(
        &config,
        &["config", "add-local", "archive", "/archive", "--digest", "SHA-257"],
    );
    assert!(!bad.status.success());
    assert!(String::from_utf8_lossy(&bad.stderr).contains("SHA-257"));
    assert_eq!(fs::read_to_string(&config)?, content);
    Ok(())
}
