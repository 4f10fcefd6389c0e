use std::io::Write;

use serial_test::serial;

use super::*;

const ENV_KEYS: [&str; 12] = [
    "DELVE_STORAGE_BACKEND",
    "DELVE_SQLITE_PATH",
    "DELVE_EMBEDDING_BASE_URL",
    "DELVE_EMBEDDING_MODEL",
    "DELVE_EMBEDDING_TIMEOUT_SECS",
    "DELVE_INDEX_MAX_CHUNKS",
    "DELVE_INDEX_MAX_IN_FLIGHT",
    "DELVE_INDEX_READY_RATIO",
    "DELVE_INDEX_SWEEP_INTERVAL_SECS",
    "DELVE_QUERY_LIMIT",
    "DELVE_QUERY_MAX_RESULTS",
    "DELVE_QUERY_DISTANCE_CEILING",
];

fn clear_env() {
    for key in ENV_KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("delve.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(f, "{body}").unwrap();
    path
}

#[test]
fn defaults() {
    let config = Config::default();
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert_eq!(config.storage.sqlite_path, "./data/delve.db");
    assert_eq!(config.embedding.base_url, "http://localhost:11434");
    assert_eq!(config.embedding.model, "qwen3-embedding");
    assert_eq!(config.embedding.timeout_secs, 10);
    assert_eq!(config.index.max_lines_per_chunk, 32);
    assert_eq!(config.index.max_chunk_chars, 2000);
    assert_eq!(config.index.max_chunks_per_file, 50);
    assert_eq!(config.index.max_in_flight, 8);
    assert_eq!(config.index.content_batch, 100);
    assert_eq!(config.index.file_batch, 10);
    assert_eq!(config.index.copy_batch, 100);
    assert_eq!(config.query.limit, 10);
    assert!((config.query.distance_ceiling - 0.5).abs() < f32::EPSILON);
    config.validate().unwrap();
}

#[test]
#[serial]
fn missing_file_uses_defaults() {
    clear_env();
    let config = Config::load(Path::new("/nonexistent/delve.toml")).unwrap();
    assert_eq!(config.embedding.model, "qwen3-embedding");
    assert_eq!(config.index.sweep_interval_secs, 60);
}

#[test]
#[serial]
fn parse_valid_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"
[storage]
backend = "memory"

[embedding]
base_url = "http://gpu-box:11434"
model = "nomic-embed-text"

[index]
max_in_flight = 4
ready_ratio = 0.75

[query]
max_results = 3
"#,
    );
    clear_env();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.embedding.base_url, "http://gpu-box:11434");
    assert_eq!(config.embedding.model, "nomic-embed-text");
    assert_eq!(config.embedding.timeout_secs, 10);
    assert_eq!(config.index.max_in_flight, 4);
    assert!((config.index.ready_ratio - 0.75).abs() < f64::EPSILON);
    assert_eq!(config.index.file_batch, 10);
    assert_eq!(config.query.max_results, 3);
    assert_eq!(config.query.limit, 10);
}

#[test]
#[serial]
fn invalid_toml_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "[storage]\nbackend = \"postgres\"\n");
    clear_env();
    let err = Config::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("failed to parse config file"));
}

#[test]
#[serial]
fn env_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "[embedding]\nmodel = \"from-file\"\n");
    clear_env();
    unsafe {
        std::env::set_var("DELVE_EMBEDDING_MODEL", "from-env");
        std::env::set_var("DELVE_STORAGE_BACKEND", "memory");
        std::env::set_var("DELVE_SQLITE_PATH", "/tmp/other.db");
        std::env::set_var("DELVE_INDEX_MAX_IN_FLIGHT", "2");
        std::env::set_var("DELVE_QUERY_DISTANCE_CEILING", "0.3");
    }

    let config = Config::load(&path).unwrap();
    clear_env();
    assert_eq!(config.embedding.model, "from-env");
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.storage.sqlite_path, "/tmp/other.db");
    assert_eq!(config.index.max_in_flight, 2);
    assert!((config.query.distance_ceiling - 0.3).abs() < f32::EPSILON);
}

#[test]
#[serial]
fn unparsable_env_values_are_ignored() {
    clear_env();
    unsafe {
        std::env::set_var("DELVE_STORAGE_BACKEND", "postgres");
        std::env::set_var("DELVE_INDEX_READY_RATIO", "most");
        std::env::set_var("DELVE_QUERY_LIMIT", "-1");
    }
    let config = Config::load(Path::new("/nonexistent/delve.toml")).unwrap();
    clear_env();
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert!((config.index.ready_ratio - 0.5).abs() < f64::EPSILON);
    assert_eq!(config.query.limit, 10);
}

#[test]
fn validate_rejects_bad_values() {
    let mut config = Config::default();
    config.index.ready_ratio = 1.5;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.index.max_in_flight = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.embedding.model = "  ".into();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.index.file_batch = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.query.distance_ceiling = f32::NAN;
    assert!(config.validate().is_err());
}

#[test]
fn memory_backend_needs_no_path() {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    config.storage.sqlite_path.clear();
    config.validate().unwrap();
}

#[test]
fn default_toml_round_trips() {
    let text = toml::to_string(&Config::default()).unwrap();
    let parsed: Config = toml::from_str(&text).unwrap();
    assert_eq!(parsed.embedding.model, "qwen3-embedding");
    assert_eq!(parsed.storage.backend, StorageBackend::Sqlite);
}
