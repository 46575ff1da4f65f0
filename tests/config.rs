use relaymeter::app::{RuntimeConfig, load_state_with_runtime};
use tempfile::TempDir;

fn test_runtime(database_dsn: String) -> RuntimeConfig {
    RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        database_dsn,
        consistency_interval_secs: 0,
        job_workers: 0,
        ..RuntimeConfig::default()
    }
}

#[tokio::test]
async fn sqlite_file_created_for_runtime_dsn() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("data").join("relaymeter.db");
    assert!(!db_path.exists());

    let runtime = test_runtime(format!("sqlite://{}", db_path.display()));
    let _state = load_state_with_runtime(runtime)
        .await
        .expect("load state");

    assert!(db_path.exists());
}

#[tokio::test]
async fn sqlite_memory_dsn_starts_without_files() {
    let runtime = test_runtime("sqlite::memory:".to_string());
    let state = load_state_with_runtime(runtime)
        .await
        .expect("load state");
    let user = state.user_store.create_user("memory-user").await.unwrap();
    assert!(
        state
            .user_store
            .get_user_balance(&user.id)
            .await
            .unwrap()
            .is_some()
    );
}

#[test]
fn defaults_keep_background_work_enabled() {
    let runtime = RuntimeConfig::default();
    assert_eq!(runtime.metrics_path, "/metrics");
    assert_eq!(runtime.job_workers, 3);
    assert_eq!(runtime.job_queue_size, 1000);
    assert_eq!(runtime.job_max_poll_attempts, 60);
    assert!(runtime.admin_token.is_none());
}
