// SPDX-License-Identifier: AGPL-3.0

//! Detach/reattach across solver contexts

#[cfg(test)]
mod checkpoint_tests {
    use simmem_config::MemoryConfig;
    use simmem_memory::{reattach_all, DetachedMemory, MemoryView, Path, SymBitVec, SymbolNamer};
    use std::collections::BTreeSet;
    use z3::ast::BV;
    use z3::{Config, Context};

    fn detached_sample() -> DetachedMemory {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let path = Path::new(&ctx);
        let mut mem = MemoryView::new(&ctx, &MemoryConfig::default(), SymbolNamer::new());

        let x = SymBitVec::symbolic(&ctx, "x", 8);
        let x_plus_one = SymBitVec::from_z3(x.as_z3(&ctx).bvadd(&BV::from_u64(&ctx, 1, 8)));
        mem.store(&path, 0x10u64, &x).unwrap();
        mem.store(&path, 0x11u64, &x_plus_one).unwrap();
        mem.store(&path, 0x12u64, &SymBitVec::from_u64(0x5a, 8))
            .unwrap();
        mem.load(&path, 0x13u64, 1).unwrap();

        mem.detach().unwrap()
    }

    #[test]
    fn test_detached_form() {
        let detached = detached_sample();
        assert_eq!(detached.id, "mem");
        assert_eq!(detached.bits, 64);
        assert_eq!(detached.len(), 4);
        assert_eq!(detached.concrete.get(&0x12), Some(&0x5a));
        assert_eq!(
            detached.symbolic.keys().copied().collect::<BTreeSet<u64>>(),
            [0x10, 0x11, 0x13].into_iter().collect()
        );
        assert_eq!(detached.namer.byte, 1);
        assert_eq!(detached.namer.checkpoint, 1);
        assert!(detached.script.contains("__ckpt_mem_0_0x10"));
    }

    #[test]
    fn test_json_round_trip_and_reattach() {
        let detached = detached_sample();
        let json = serde_json::to_string(&detached).unwrap();
        let restored: DetachedMemory = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, detached);

        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let reattached = restored.reattach(&ctx).unwrap();
        assert_eq!(reattached.constraints.len(), 3);

        let mut path = Path::new(&ctx);
        path.extend(reattached.constraints);
        let mut mem = reattached.memory;
        assert_eq!(mem.len(), 4);

        let (lo, _) = mem.load(&path, 0x10u64, 1).unwrap();
        let (hi, _) = mem.load(&path, 0x11u64, 1).unwrap();
        let (fixed, _) = mem.load(&path, 0x12u64, 1).unwrap();
        assert_eq!(fixed.as_u64().unwrap(), 0x5a);

        // The relation between the two bytes survives the trip
        let lo_plus_one = SymBitVec::from_z3(lo.as_z3(&ctx).bvadd(&BV::from_u64(&ctx, 1, 8)));
        assert!(!path.check(&hi.eq(&lo_plus_one, &ctx).not()).unwrap());

        // The free byte stays free
        let (free, _) = mem.load(&path, 0x13u64, 1).unwrap();
        assert!(path.check(&free.eq_u64(0, &ctx)).unwrap());
        assert!(path.check(&free.eq_u64(0xff, &ctx)).unwrap());
    }

    #[test]
    fn test_reattached_namer_does_not_reuse_names() {
        let detached = detached_sample();
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let path = Path::new(&ctx);

        let mut mem = detached.reattach(&ctx).unwrap().memory;
        assert_eq!(mem.namer().state(), detached.namer);

        let (fresh, _) = mem.load(&path, 0x13u64 + 1, 1).unwrap();
        assert_eq!(fresh.to_string(), "mem_14_1");
    }

    #[test]
    fn test_reattached_view_diffs_by_key_sets() {
        let detached = detached_sample();
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mem = detached.reattach(&ctx).unwrap().memory;
        let other = MemoryView::with_backer(
            &ctx,
            &MemoryConfig::default(),
            SymbolNamer::new(),
            vec![(0x20, 0)],
        );

        let expected: BTreeSet<u64> = [0x10, 0x11, 0x12, 0x13, 0x20].into_iter().collect();
        assert_eq!(mem.changed_bytes(&other).unwrap(), expected);
    }

    #[test]
    fn test_reattach_stash_shares_namer() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let path = Path::new(&ctx);
        let mut base = MemoryView::new(&ctx, &MemoryConfig::default(), SymbolNamer::new());
        base.load(&path, 0u64, 1).unwrap();
        let mut sibling = base.copy();
        sibling.load(&path, 1u64, 1).unwrap();

        let stash = vec![base.detach().unwrap(), sibling.detach().unwrap()];

        let target_cfg = Config::new();
        let target = Context::new(&target_cfg);
        let reattached = reattach_all(&target, &stash).unwrap();
        assert_eq!(reattached.len(), 2);

        let first = reattached[0].memory.namer();
        let second = reattached[1].memory.namer();
        assert!(first.shares_counters(second));
        assert_eq!(first.state().byte, 2);
        assert_eq!(first.state().checkpoint, 2);
    }

    #[test]
    fn test_trim_then_detach() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let path = Path::new(&ctx);
        let mut mem = MemoryView::with_backer(
            &ctx,
            &MemoryConfig::default(),
            SymbolNamer::new(),
            vec![(0, 1), (1, 2)],
        );
        let mut child = mem.copy();
        child.store(&path, 1u64, &SymBitVec::from_u64(9, 8)).unwrap();
        mem.store(&path, 2u64, &SymBitVec::from_u64(3, 8)).unwrap();

        child.trim();
        let detached = child.detach().unwrap();
        assert_eq!(
            detached.concrete.into_iter().collect::<Vec<_>>(),
            vec![(0, 1), (1, 9)]
        );
    }
}
