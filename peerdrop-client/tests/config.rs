use std::{io::Write, path::PathBuf};

use peerdrop_client::config::{
    MAX_CONFIG_BYTES, SavedConfig, load_config_from_path, save_config_to_path,
};

#[test]
fn missing_config_is_not_an_error() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let loaded = load_config_from_path(&dir.path().join("config.json")).expect("load");
    assert!(loaded.is_none());
}

#[test]
fn saved_config_loads_back() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("nested").join("config.json");
    let cfg = SavedConfig {
        signal_url: Some("wss://signal.example.com/ws".to_owned()),
        download_dir: Some(PathBuf::from("/tmp/peerdrop-inbox")),
    };

    save_config_to_path(&path, &cfg).expect("save config");
    assert!(!path.with_extension("json.tmp").exists());
    assert_eq!(load_config_from_path(&path).expect("load"), Some(cfg));
}

#[test]
fn invalid_config_is_refused_on_save() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("config.json");
    let cfg = SavedConfig {
        signal_url: Some("https://signal.example.com".to_owned()),
        download_dir: None,
    };

    let err = save_config_to_path(&path, &cfg).expect_err("http url must be refused");
    assert!(err.to_string().contains("ws://"), "unexpected error: {err}");
    assert!(!path.exists());
}

#[test]
fn hand_edited_invalid_config_fails_to_load() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"signal_url": "ftp://nope"}"#).expect("write config");

    assert!(load_config_from_path(&path).is_err());
}

#[test]
fn oversized_config_is_rejected() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("config.json");

    let mut file = std::fs::File::create(&path).expect("create config.json");
    file.write_all(&vec![b' '; (MAX_CONFIG_BYTES as usize) + 1024])
        .expect("write oversized config.json");
    drop(file);

    let err = load_config_from_path(&path).expect_err("oversized file should error");
    let msg = err.to_string();
    assert!(msg.contains("too large"), "unexpected error: {msg}");
}
