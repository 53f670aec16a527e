// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use memfs_core::{
    FaultOp, FaultPolicy, FaultRule, FsError, MemFs, MemFsConfig, Operation, Reply, Request,
    SetAttr, UnsupportedOp, ROOT_ID,
};

fn create_test_fs() -> MemFs {
    MemFs::new(MemFsConfig::default())
}

#[test]
fn scenario_write_truncate_extend() {
    let fs = create_test_fs();

    // A
    let d1 = fs.mkdir(ROOT_ID, "d1", 0o755).unwrap().ino;
    let f = fs.create(d1, "f", 0o644).unwrap().entry.ino;
    assert_eq!(fs.write(f, 0, b"Hello!").unwrap(), 6);
    assert_eq!(fs.getattr(f).unwrap().size, 6);

    // B
    fs.setattr(f, &SetAttr::default().with_size(3)).unwrap();
    assert_eq!(fs.read(f, 0, 10).unwrap(), b"Hel");

    // C
    fs.setattr(f, &SetAttr::default().with_size(10)).unwrap();
    let mut expected = b"Hel".to_vec();
    expected.extend_from_slice(&[0; 7]);
    assert_eq!(fs.read(f, 0, 10).unwrap(), expected);

    assert!(fs.audit().is_ok());
}

#[test]
fn scenario_periodic_create_faults() {
    let policy = FaultPolicy::enabled(vec![FaultRule::periodic(&[FaultOp::Create])]);
    let fs = MemFs::new(MemFsConfig::default().with_fault_policy(policy));
    let dir = fs.mkdir(ROOT_ID, "d", 0o755).unwrap().ino;

    let mut outcomes = Vec::new();
    for i in 0..6 {
        // Calls to other families never move the create counter.
        fs.mkdir(dir, &format!("sub{i}"), 0o755).unwrap();
        fs.lookup(ROOT_ID, "d").unwrap();
        outcomes.push(fs.create(dir, &format!("f{i}"), 0o644).map(|c| c.entry.ino));
    }

    for (i, outcome) in outcomes.iter().enumerate() {
        if i % 2 == 1 {
            assert_eq!(outcome, &Err(FsError::TransientStale), "call {}", i + 1);
            assert_eq!(fs.lookup(dir, &format!("f{i}")), Err(FsError::NotFound));
        } else {
            assert!(outcome.is_ok(), "call {}", i + 1);
        }
    }
}

#[test]
fn root_parent_is_exempt_from_faults() {
    let policy = FaultPolicy::enabled(vec![FaultRule::periodic(&[FaultOp::Create])]);
    let fs = MemFs::new(MemFsConfig::default().with_fault_policy(policy));
    for i in 0..5 {
        fs.create(ROOT_ID, &format!("f{i}"), 0o644).unwrap();
    }
    assert_eq!(fs.faults().stats()[0].invocations, 5);
    assert_eq!(fs.faults().stats()[0].faults, 0);
}

#[test]
fn nested_tree_lifecycle() {
    let fs = create_test_fs();
    let a = fs.mkdir(ROOT_ID, "a", 0o755).unwrap().ino;
    let b = fs.mkdir(a, "b", 0o700).unwrap().ino;
    let f = fs.create(b, "file", 0o600).unwrap().entry.ino;
    fs.write(f, 0, b"payload").unwrap();

    fs.rename(b, "file", ROOT_ID, "moved").unwrap();
    assert_eq!(fs.lookup(ROOT_ID, "moved").unwrap().ino, f);
    assert_eq!(fs.read(f, 0, 64).unwrap(), b"payload");

    fs.rename(a, "b", ROOT_ID, "b").unwrap();
    fs.rmdir(ROOT_ID, "a").unwrap();
    fs.rmdir(ROOT_ID, "b").unwrap();
    fs.unlink(ROOT_ID, "moved").unwrap();

    assert_eq!(fs.node_count(), 1);
    assert!(fs.readdir(ROOT_ID, 0, 16).unwrap().is_empty());
    assert!(fs.audit().is_ok());
}

#[test]
fn dispatch_covers_the_request_surface() {
    let fs = create_test_fs();
    let Reply::Entry(dir) = fs
        .dispatch(Request::Mkdir {
            parent: ROOT_ID,
            name: "d".into(),
            mode: 0o755,
        })
        .unwrap()
    else {
        panic!("expected entry reply");
    };

    assert!(matches!(
        fs.dispatch(Request::OpenDir { ino: dir.ino }),
        Ok(Reply::Opened(_))
    ));
    assert_eq!(
        fs.dispatch(Request::ReadDir {
            ino: ROOT_ID,
            offset: 0,
            capacity: 8
        })
        .map(|reply| match reply {
            Reply::DirEntries(entries) => entries.len(),
            other => panic!("unexpected {other:?}"),
        }),
        Ok(1)
    );
    assert!(matches!(
        fs.dispatch(Request::StatFs { ino: ROOT_ID }),
        Ok(Reply::StatFs(_))
    ));
    assert_eq!(
        fs.dispatch(Request::Rmdir {
            parent: ROOT_ID,
            name: "d".into()
        }),
        Ok(Reply::Empty)
    );
    assert_eq!(
        fs.dispatch(Request::Forget {
            ino: dir.ino,
            nlookup: 1
        }),
        Ok(Reply::Empty)
    );
}

#[test]
fn unsupported_operations_are_rejected_without_side_effects() {
    let fs = create_test_fs();
    fs.create(ROOT_ID, "f", 0o644).unwrap();
    for op in UnsupportedOp::ALL {
        assert!(!Operation::from(op).is_supported(), "{op:?}");
        let err = fs.dispatch(Request::Unsupported(op)).unwrap_err();
        assert_eq!(err, FsError::NotSupported);
        assert_eq!(err.errno(), libc::ENOSYS);
    }
    assert_eq!(fs.node_count(), 2);
}

#[test]
fn readdirplus_lists_like_readdir_and_access_is_refused() {
    let fs = create_test_fs();
    fs.create(ROOT_ID, "f", 0o644).unwrap();
    fs.mkdir(ROOT_ID, "d", 0o755).unwrap();

    let reply = fs
        .dispatch(Request::ReadDirPlus {
            ino: ROOT_ID,
            offset: 0,
            capacity: 8,
        })
        .unwrap();
    assert_eq!(reply, Reply::DirEntries(fs.readdir(ROOT_ID, 0, 8).unwrap()));

    assert_eq!(Operation::Access.unsupported(), Some(UnsupportedOp::Access));
    assert_eq!(
        fs.dispatch(Request::Unsupported(UnsupportedOp::Access)),
        Err(FsError::NotSupported)
    );
    assert_eq!(fs.node_count(), 3);
}
