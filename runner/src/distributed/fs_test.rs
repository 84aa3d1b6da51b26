use super::fs::{registered_pids, write_atomic, write_json_atomic, PidFile};
use std::fs;

#[test]
pub fn write_atomic_overwrites_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("file.json");

    write_atomic(&path, b"first").unwrap();
    write_atomic(&path, b"second").unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    // only the target remains, no temporary siblings
    assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
}

#[test]
pub fn write_json_atomic_pretty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");

    write_json_atomic(&path, &vec![1, 2, 3]).unwrap();

    let parsed: Vec<u32> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(parsed, vec![1, 2, 3]);
}

#[test]
pub fn pid_file_registers_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();

    let pid_file = PidFile::register(dir.path(), "run").unwrap();
    let pids = registered_pids(dir.path()).unwrap();

    assert_eq!(pids.len(), 1);
    assert_eq!(pids[0].0, pid_file.path());
    assert_eq!(pids[0].1, std::process::id() as i32);

    drop(pid_file);
    assert!(registered_pids(dir.path()).unwrap().is_empty());
}

#[test]
pub fn registered_pids_missing_dir() {
    let dir = tempfile::tempdir().unwrap();

    assert!(registered_pids(&dir.path().join("absent")).unwrap().is_empty());
}

#[test]
pub fn registered_pids_skips_garbage() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("monitor.pid"), "not a pid").unwrap();
    fs::write(dir.path().join("notes.txt"), "123").unwrap();
    fs::write(dir.path().join("worker_1.pid"), "4242\n").unwrap();

    let pids = registered_pids(dir.path()).unwrap();

    assert_eq!(pids.len(), 1);
    assert_eq!(pids[0].1, 4242);
}
