use backfill_orchestrator::config::{BackendSelection, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("BACKFILL_"))
        .collect();
    unsafe {
        for key in keys {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader_for(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.log_format, "json");
    assert_eq!(cfg.execution_backend, BackendSelection::Auto);
    assert_eq!(cfg.runner.timeout_seconds, 72_000);
    assert_eq!(cfg.runner.max_retries, 3);
    assert_eq!(cfg.max_unit_name_versions, 20);
    assert_eq!(cfg.stale_pending_hours, 1);
    assert!(cfg.operator_tokens.is_empty());
    cfg.bind_addr().expect("default bind addr parses");
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "BACKFILL_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.staging",
        "BACKFILL_API_BIND_ADDR=192.168.0.10:5000\nBACKFILL_RUNNER_REGION=europe-west1\n",
    );
    write_env_file(
        &temp_dir,
        ".env.staging.local",
        "BACKFILL_API_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "BACKFILL_PROFILE=staging\nBACKFILL_API_BIND_ADDR=127.0.0.1:4000\nBACKFILL_OPERATOR_TOKENS=alpha,beta\n",
    );

    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "staging");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.runner.region, "europe-west1");
    assert_eq!(cfg.operator_tokens, vec!["alpha", "beta"]);
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "BACKFILL_API_BIND_ADDR=127.0.0.1:3000\nBACKFILL_EXECUTION_BACKEND=local\n",
    );

    unsafe {
        env::set_var("BACKFILL_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("BACKFILL_EXECUTION_BACKEND", "isolated");
        env::set_var("BACKFILL_RUNNER_PROJECT_ID", "acme-data");
        env::set_var("BACKFILL_RUNNER_IMAGE", "gcr.io/acme-data/historical:latest");
    }

    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.execution_backend, BackendSelection::Isolated);
    assert_eq!(cfg.runner.project_id.as_deref(), Some("acme-data"));

    clear_env();
}

#[test]
fn unknown_execution_backend_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("BACKFILL_EXECUTION_BACKEND", "kubernetes");
    }

    let err = loader_for(&temp_dir)
        .load()
        .expect_err("unknown backend should fail");
    assert!(err.to_string().contains("execution backend must be one of"));

    clear_env();
}

#[test]
fn invalid_log_format_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "BACKFILL_LOG_FORMAT=xml\n");

    let err = loader_for(&temp_dir)
        .load()
        .expect_err("invalid log format should fail");
    assert!(err.to_string().contains("log format must be 'json' or 'pretty'"));
}

#[test]
fn server_validation_needs_tokens_and_a_bind_address() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "BACKFILL_API_BIND_ADDR=not-an-addr\n");

    let cfg = loader_for(&temp_dir).load().expect("config loads");
    let err = cfg
        .validate_for_server()
        .expect_err("missing tokens should fail");
    assert!(err.to_string().contains("no operator tokens configured"));

    unsafe {
        env::set_var("BACKFILL_OPERATOR_TOKEN", "single-token");
    }
    let cfg = loader_for(&temp_dir).load().expect("config loads");
    assert_eq!(cfg.operator_tokens, vec!["single-token"]);
    let err = cfg
        .validate_for_server()
        .expect_err("invalid bind addr should fail");
    assert!(err.to_string().contains("invalid api bind address"));

    clear_env();
}

#[test]
fn redacted_json_hides_secrets() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "BACKFILL_OPERATOR_TOKENS=super-secret\nBACKFILL_RUNNER_ACCESS_TOKEN=ya29.token\nBACKFILL_DATABASE_URL=postgresql://app:hunter2@db:5432/backfill\n",
    );

    let cfg = loader_for(&temp_dir).load().expect("config loads");
    let json = cfg.redacted_json().unwrap();
    assert!(!json.contains("super-secret"));
    assert!(!json.contains("ya29.token"));
    assert!(!json.contains("hunter2"));
    assert!(json.contains("[REDACTED]"));
}
