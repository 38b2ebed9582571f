// SPDX-License-Identifier: AGPL-3.0

//! Dumping and loading checkpoint stashes on disk

#[cfg(test)]
mod cache_tests {
    use simmem_cache::{CacheFile, CheckpointCache, DumpOutcome, CACHE_VERSION};
    use simmem_config::MemoryConfig;
    use simmem_exceptions::CacheError;
    use simmem_memory::{reattach_all, MemoryView, Path, SymBitVec, SymbolNamer};
    use std::io::Write;
    use z3::{Config, Context};

    fn config_in(dir: &std::path::Path) -> MemoryConfig {
        MemoryConfig {
            cache_dir: dir.to_path_buf(),
            cache_template: Some("{name}-{binhash}-{addr}.cache".to_string()),
            ..MemoryConfig::default()
        }
    }

    fn binary_in(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("target.bin");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"\x7fELF not really").unwrap();
        path
    }

    #[test]
    fn test_dump_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let binary = binary_in(dir.path());
        let cache = CheckpointCache::from_config(&config_in(dir.path()), &binary).unwrap();

        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let path = Path::new(&ctx);
        let mut mem = MemoryView::new(&ctx, &MemoryConfig::default(), SymbolNamer::new());
        mem.store(&path, 0x10u64, &SymBitVec::from_u64(0xbeef, 16))
            .unwrap();
        mem.load(&path, 0x20u64, 1).unwrap();
        let mut sibling = mem.copy();
        sibling
            .store(&path, 0x10u64, &SymBitVec::from_u64(0x11, 8))
            .unwrap();

        let mut views = vec![mem, sibling];
        let outcome = cache.dump_views(0x400000, &mut views);
        let written = cache.path_for(Some(0x400000));
        assert_eq!(outcome, DumpOutcome::Written(written.clone()));
        assert!(written
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("target.bin-"));

        // A second dump for the same key leaves the file alone
        assert_eq!(
            cache.dump(0x400000, &[]),
            DumpOutcome::Skipped(written.clone())
        );

        let file = CacheFile::read(&written).unwrap();
        assert_eq!(file.version, CACHE_VERSION);
        assert_eq!(file.stash.len(), 2);

        let stash = cache.load(Some(0x400000)).unwrap().unwrap();
        let target_cfg = Config::new();
        let target = Context::new(&target_cfg);
        let mut reattached = reattach_all(&target, &stash).unwrap();
        let target_path = Path::new(&target);

        let (first, _) = reattached[0].memory.load(&target_path, 0x10u64, 2).unwrap();
        assert_eq!(first.as_u64().unwrap(), 0xbeef);
        let (second, _) = reattached[1].memory.load(&target_path, 0x10u64, 1).unwrap();
        assert_eq!(second.as_u64().unwrap(), 0x11);
        assert_eq!(reattached[1].constraints.len(), 1);
    }

    #[test]
    fn test_load_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache =
            CheckpointCache::with_binhash(&config_in(dir.path()), "prog", "00ff").unwrap();
        assert!(cache.load(Some(0x1)).unwrap().is_none());
        assert!(cache.load_or_skip(Some(0x1)).is_none());
    }

    #[test]
    fn test_stale_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let old = CheckpointCache::with_binhash(&config, "prog", "aaaa").unwrap();
        let template = MemoryConfig {
            cache_template: Some("{name}-{addr}.cache".to_string()),
            ..config
        };
        let writer = CheckpointCache::with_binhash(&template, "prog", "aaaa").unwrap();
        let reader = CheckpointCache::with_binhash(&template, "prog", "bbbb").unwrap();

        assert!(writer.dump(0x8, &[]).is_written());
        assert!(!old.exists(Some(0x8)));
        assert!(matches!(
            reader.load(Some(0x8)),
            Err(CacheError::Stale { .. })
        ));
        assert!(reader.load_or_skip(Some(0x8)).is_none());
    }

    #[test]
    fn test_corrupt_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache =
            CheckpointCache::with_binhash(&config_in(dir.path()), "prog", "00").unwrap();
        std::fs::write(cache.path_for(Some(0x2)), b"{ not json").unwrap();

        assert!(matches!(
            cache.load(Some(0x2)),
            Err(CacheError::Serialization(_))
        ));
    }

    #[test]
    fn test_unwritable_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();
        let config = MemoryConfig {
            cache_dir: blocker.join("nested"),
            ..MemoryConfig::default()
        };
        let cache = CheckpointCache::with_binhash(&config, "prog", "00").unwrap();

        assert!(matches!(cache.dump(0x1, &[]), DumpOutcome::Failed(_)));
    }
}
