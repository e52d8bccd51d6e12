use std::fs;
use std::sync::{Mutex, OnceLock};

use tacticloops_core as tlc;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

#[test]
fn dotenv_parses_quotes_exports_and_comments() {
    let _g = env_lock().lock().unwrap();
    let td = tempfile::tempdir().unwrap();
    let p = td.path().join(".env");
    fs::write(
        &p,
        "# keys\nexport TL_TEST_A=\"quoted value\"\nTL_TEST_B='single'\nTL_TEST_C = plain \nnot a pair\n=novalue\n",
    )
    .unwrap();
    std::env::remove_var("TL_TEST_A");
    std::env::remove_var("TL_TEST_B");
    std::env::remove_var("TL_TEST_C");

    let m = tlc::config::parse_dotenv(&p);
    assert_eq!(m.get("TL_TEST_A").map(String::as_str), Some("quoted value"));
    assert_eq!(m.get("TL_TEST_B").map(String::as_str), Some("single"));
    assert_eq!(m.get("TL_TEST_C").map(String::as_str), Some("plain"));
    assert_eq!(m.len(), 3);
}

#[test]
fn dotenv_never_overrides_existing_vars() {
    let _g = env_lock().lock().unwrap();
    let td = tempfile::tempdir().unwrap();
    fs::write(
        td.path().join(".env"),
        "TL_TEST_KEEP=from_file\nTL_TEST_NEW=from_file\n",
    )
    .unwrap();
    std::env::set_var("TL_TEST_KEEP", "from_env");
    std::env::remove_var("TL_TEST_NEW");

    tlc::config::load_dotenv_if_present(td.path());
    assert_eq!(std::env::var("TL_TEST_KEEP").unwrap(), "from_env");
    assert_eq!(std::env::var("TL_TEST_NEW").unwrap(), "from_file");

    // cleanup for other tests
    std::env::remove_var("TL_TEST_KEEP");
    std::env::remove_var("TL_TEST_NEW");
}

#[test]
fn repo_dotenv_feeds_search_config() {
    let _g = env_lock().lock().unwrap();
    let td = tempfile::tempdir().unwrap();
    fs::write(
        td.path().join(".env"),
        "TACTICLOOPS_MAX_DEPTH=4\nTACTICLOOPS_OFFLINE=1\n",
    )
    .unwrap();
    std::env::remove_var("TACTICLOOPS_MAX_DEPTH");
    std::env::remove_var("TACTICLOOPS_OFFLINE");
    std::env::set_var("TACTICLOOPS_DOTENV_SEARCH", "0");

    tlc::config::load_dotenv_smart(td.path());
    let cfg = tlc::SearchConfig::from_env().unwrap();
    assert_eq!(cfg.max_depth, 4);
    assert!(cfg.offline);

    // cleanup for other tests
    std::env::remove_var("TACTICLOOPS_MAX_DEPTH");
    std::env::remove_var("TACTICLOOPS_OFFLINE");
    std::env::remove_var("TACTICLOOPS_DOTENV_SEARCH");
}

#[tokio::test]
async fn offline_suggestions_need_no_model() {
    let cfg = tlc::SearchConfig {
        offline: true,
        ..tlc::SearchConfig::default()
    };
    let ranked = cfg.processor().unwrap().candidates("⊢ 2 + 2 = 4").await.unwrap();
    assert_eq!(ranked.first().map(|s| s.tactic.as_str()), Some("rfl"));
    assert!(ranked
        .windows(2)
        .all(|w| w[0].confidence >= w[1].confidence));
}
