mod common;

use std::fs;
use std::path::Path;

use pm_analysis::discovery::{DiscoveryError, ScriptDiscovery};
use pm_analysis::types::AnalysisConfig;

use common::scratch;

fn discovery_in(dir: &Path) -> ScriptDiscovery {
    ScriptDiscovery::new(&AnalysisConfig {
        dir: dir.to_path_buf(),
        ..AnalysisConfig::default()
    })
}

fn populate(dir: &Path, files: &[&str]) {
    fs::create_dir_all(dir).unwrap();
    for f in files {
        fs::write(dir.join(f), "print('ok')\n").unwrap();
    }
}

#[test]
fn lists_units_in_name_order() {
    let work = scratch("discovery-list");
    let dir = work.path().join("analysis");
    populate(
        &dir,
        &[
            "win_rate_by_price.py",
            "calibration.py",
            "__init__.py",
            "notes.md",
            "maker_taker_returns.py",
        ],
    );
    fs::create_dir_all(dir.join("util.py")).unwrap();

    let d = discovery_in(&dir);
    let names: Vec<String> = d.list_all().unwrap().map(|u| u.name).collect();
    assert_eq!(
        names,
        vec!["calibration", "maker_taker_returns", "win_rate_by_price"]
    );

    // Restartable: a second pass sees the same sequence, and new files.
    populate(&dir, &["arbitrage.py"]);
    let again: Vec<String> = d.list_all().unwrap().map(|u| u.name).collect();
    assert_eq!(again[0], "arbitrage");
    assert_eq!(again.len(), 4);
}

#[test]
fn resolve_accepts_name_with_or_without_suffix() {
    let work = scratch("discovery-suffix");
    let dir = work.path().join("analysis");
    populate(&dir, &["volume_by_hour.py", "calibration.py"]);

    let d = discovery_in(&dir);
    let bare = d.resolve("volume_by_hour").unwrap();
    let suffixed = d.resolve("volume_by_hour.py").unwrap();
    assert_eq!(bare, suffixed);
    assert_eq!(bare.path, dir.join("volume_by_hour.py"));
}

#[test]
fn resolve_never_guesses_unrelated_units() {
    let work = scratch("discovery-missing");
    let dir = work.path().join("analysis");
    populate(&dir, &["volume_by_hour.py", "calibration.py"]);

    let err = discovery_in(&dir).resolve("nonexistent").unwrap_err();
    match err {
        DiscoveryError::NotFound {
            identifier,
            suggestions,
        } => {
            assert_eq!(identifier, "nonexistent");
            assert!(suggestions.is_empty());
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn ambiguous_prefix_is_rejected() {
    let work = scratch("discovery-ambiguous");
    let dir = work.path().join("analysis");
    populate(&dir, &["volume_daily.py", "volume_hourly.py", "win.py", "win_rate.py"]);

    let d = discovery_in(&dir);
    match d.resolve("volume").unwrap_err() {
        DiscoveryError::Ambiguous { candidates, .. } => {
            assert_eq!(candidates, vec!["volume_daily", "volume_hourly"]);
        }
        other => panic!("expected Ambiguous, got {other:?}"),
    }

    assert_eq!(d.resolve("volume_h").unwrap().name, "volume_hourly");
    // An exact name beats a longer name sharing the prefix.
    assert_eq!(d.resolve("win").unwrap().name, "win");
}

#[test]
fn missing_directory_is_an_io_error() {
    let work = scratch("discovery-nodir");
    let err = discovery_in(&work.path().join("absent")).list_all().err().unwrap();
    assert!(matches!(err, DiscoveryError::Io { .. }));
}

#[cfg(unix)]
#[test]
fn symlinked_scripts_are_discovered() {
    use std::os::unix::fs::symlink;

    let work = scratch("discovery-symlink");
    let shared = work.path().join("shared");
    populate(&shared, &["calibration.py"]);

    let dir = work.path().join("analysis");
    fs::create_dir_all(&dir).unwrap();
    symlink(shared.join("calibration.py"), dir.join("calibration.py")).unwrap();
    symlink(shared.join("gone.py"), dir.join("dangling.py")).unwrap();
    symlink(&shared, dir.join("linked_dir.py")).unwrap();

    let d = discovery_in(&dir);
    let names: Vec<String> = d.list_all().unwrap().map(|u| u.name).collect();
    assert_eq!(names, vec!["calibration"]);
    assert_eq!(d.resolve("calibration.py").unwrap().path, dir.join("calibration.py"));
}
