//! End-to-end scenarios driving the core stack with a manual clock and a
//! fixed seed: the delay, flakey, maxsize, inheritance, heatmap, and
//! multi-effect behaviors a user scripts through xattrs.

use bf_harness::TestFs;
use bf_types::ROOT_INO;

/// S1: a read delay holds reads for the configured duration and leaves
/// writes untouched.
#[test]
fn s1_delay_reads_only() {
    let t = TestFs::mem();
    let file = t.mkfile_at_root("t.txt");
    t.write(file, 0, b"works\n").unwrap();

    t.attach(file, "bf.effect.delay", r#"{"duration_ms":1000,"op":"r"}"#);

    let before = t.clock.total_slept_ms();
    let data = t.read(file, 0, 4096).unwrap();
    assert_eq!(data, b"works\n");
    assert_eq!(t.clock.total_slept_ms() - before, 1000);

    let before = t.clock.total_slept_ms();
    t.write(file, 6, b"more\n").unwrap();
    assert_eq!(t.clock.total_slept_ms() - before, 0);
}

/// S2: probabilistic flakey under a fixed seed fails close to N*p writes,
/// and exactly the same number on replay.
#[test]
fn s2_flakey_prob_is_deterministic_under_seed() {
    let run = || {
        let t = TestFs::mem_seeded(42);
        let file = t.mkfile_at_root("t.txt");
        t.attach(file, "bf.effect.flakey", r#"{"prob":0.5,"op":"w"}"#);
        (0_u64..1000)
            .filter(|i| {
                match t.write(file, *i, &[0_u8]) {
                    Ok(_) => false,
                    Err(err) => {
                        assert_eq!(err.to_errno(), libc::EIO);
                        true
                    }
                }
            })
            .count()
    };

    let failures = run();
    assert!(
        (400..=600).contains(&failures),
        "expected ~500 failures, got {failures}"
    );
    assert_eq!(run(), failures);
}

/// S3: a subtree byte budget rejects the byte that would overflow it and
/// frees up after unlink.
#[test]
fn s3_maxsize_budget_lifecycle() {
    let t = TestFs::mem();
    let dir = t.mkdir(ROOT_INO, "dir");
    t.attach(dir, "bf.effect.maxsize", r#"{"limit":1024}"#);

    let a = t.mkfile(dir, "a");
    let b = t.mkfile(dir, "b");
    t.write(a, 0, &[0_u8; 512]).unwrap();
    t.write(b, 0, &[0_u8; 512]).unwrap();

    let err = t.write(a, 512, &[0_u8; 1]).unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOSPC);
    let err = t.write(b, 512, &[0_u8; 1]).unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOSPC);

    t.fs.unlink(&t.cx, dir, "a").unwrap();
    t.write(b, 512, &[0_u8; 512]).unwrap();
}

/// S4: an effect on a directory binds every descendant until detached.
#[test]
fn s4_inheritance_attach_detach() {
    let t = TestFs::mem();
    let dir = t.mkdir(ROOT_INO, "dir");
    let sub = t.mkdir(dir, "sub");
    let file = t.mkfile(sub, "file");

    t.attach(dir, "bf.effect.flakey", r#"{"prob":1.0,"op":"w"}"#);
    let err = t.write(file, 0, b"x").unwrap_err();
    assert_eq!(err.to_errno(), libc::EIO);

    t.detach(dir, "bf.effect.flakey");
    t.write(file, 0, b"x").unwrap();
}

/// S5: heatmap buckets round offsets to the configured alignment and
/// read back through getfattr.
#[test]
fn s5_heatmap_two_buckets() {
    let t = TestFs::mem();
    let file = t.mkfile_at_root("t.txt");
    t.write(file, 0, &[0_u8; 8192]).unwrap();
    t.attach(file, "bf.effect.heatmap", r#"{"align":4096}"#);

    t.read(file, 0, 100).unwrap();
    t.read(file, 5000, 100).unwrap();

    let value = t.control_json(file, "bf.effect.heatmap");
    let buckets = value["buckets"].as_object().unwrap();
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets["0"]["r"], 1);
    assert_eq!(buckets["4096"]["r"], 1);
    assert!(buckets["0"].get("w").is_none());
}

/// S6: two delay instances of the same kind (distinct suffixes) both
/// apply; their delays sum.
#[test]
fn s6_same_kind_delays_sum() {
    let t = TestFs::mem();
    let file = t.mkfile_at_root("t.txt");
    t.attach(file, "bf.effect.delay-1", r#"{"duration_ms":100}"#);
    t.attach(file, "bf.effect.delay-2", r#"{"duration_ms":200}"#);

    let before = t.clock.total_slept_ms();
    t.read(file, 0, 1).unwrap();
    assert_eq!(t.clock.total_slept_ms() - before, 300);

    // Replacing one instance swaps its duration rather than stacking.
    t.attach(file, "bf.effect.delay-2", r#"{"duration_ms":50}"#);
    let before = t.clock.total_slept_ms();
    t.read(file, 0, 1).unwrap();
    assert_eq!(t.clock.total_slept_ms() - before, 150);
}

/// A delay ahead of an injected failure still runs: the error arrives
/// late, like a hung-then-failed device.
#[test]
fn delay_then_failure_sleeps_before_failing() {
    let t = TestFs::mem();
    let dir = t.mkdir(ROOT_INO, "d");
    let file = t.mkfile(dir, "f");
    t.attach(dir, "bf.effect.delay", r#"{"duration_ms":400,"op":"w"}"#);
    t.attach(file, "bf.effect.flakey", r#"{"prob":1.0,"op":"w"}"#);

    let before = t.clock.total_slept_ms();
    let err = t.write(file, 0, b"x").unwrap_err();
    assert_eq!(err.to_errno(), libc::EIO);
    assert_eq!(t.clock.total_slept_ms() - before, 400);
}

/// The same budget scenario over a real host directory: pre-existing
/// host files count against the limit after the first recompute.
#[test]
fn maxsize_over_host_directory() {
    use bf_core::DirBacking;
    use std::sync::Arc;

    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("dir")).unwrap();
    std::fs::write(tmp.path().join("dir/preexisting"), [0_u8; 600]).unwrap();

    let t = TestFs::with_backing(Arc::new(DirBacking::open(tmp.path()).unwrap()), 42);
    let dir = t.fs.lookup(ROOT_INO, "dir").unwrap().ino;
    t.attach(dir, "bf.effect.maxsize", r#"{"limit":1024}"#);

    let f = t.mkfile(dir, "fresh");
    let err = t.write(f, 0, &[0_u8; 425]).unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOSPC);
    t.write(f, 0, &[0_u8; 424]).unwrap();

    std::fs::remove_file(tmp.path().join("dir/preexisting")).unwrap();
    // The mount did not see that unlink, so the running sum still holds;
    // removing through the mount is what frees budget.
    t.fs.unlink(&t.cx, dir, "fresh").unwrap();
    let g = t.mkfile(dir, "fresh2");
    t.write(g, 0, &[0_u8; 424]).unwrap();
}

/// Windowed flakey over a scripted timeline, including replace semantics
/// re-anchoring the window.
#[test]
fn windowed_flakey_reanchors_on_replace() {
    let t = TestFs::mem();
    let file = t.mkfile_at_root("f");
    t.clock.advance(5_000);
    t.attach(file, "bf.effect.flakey", r#"{"avail":200,"unavail":100}"#);

    t.read(file, 0, 1).unwrap();
    t.clock.advance(250); // into the unavailable window
    assert!(t.read(file, 0, 1).is_err());

    // Re-attaching replaces the instance and restarts the timeline.
    t.attach(file, "bf.effect.flakey", r#"{"avail":200,"unavail":100}"#);
    t.read(file, 0, 1).unwrap();
}
