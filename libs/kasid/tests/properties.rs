// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg(not(loom))]

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{System, cpu};
use kasid::test_utils::Event;
use kasid::{Config, CpuMask, MmContext};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Switch { cpu: usize, ctx: usize },
    MarkStale { cpu: usize, ctx: usize },
}

fn op(cpus: usize, contexts: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..cpus, 0..contexts).prop_map(|(cpu, ctx)| Op::Switch { cpu, ctx }),
        1 => (0..cpus, 0..contexts).prop_map(|(cpu, ctx)| Op::MarkStale { cpu, ctx }),
    ]
}

fn scenario() -> impl Strategy<Value = (usize, Option<u32>, usize, Vec<Op>)> {
    (1..=4usize, prop::option::of(1..=3u32), 1..=12usize).prop_flat_map(
        |(cpus, generation_bits, contexts)| {
            (
                Just(cpus),
                Just(generation_bits),
                Just(contexts),
                prop::collection::vec(op(cpus, contexts), 1..200),
            )
        },
    )
}

fn check_tags(sys: &System, contexts: &[Arc<MmContext>]) -> Result<(), TestCaseError> {
    let layout = sys.manager.layout().unwrap();
    let generation = sys.manager.generation().unwrap();

    // current-generation slots are owned by exactly one address space
    let mut owners = BTreeMap::new();
    for (index, ctx) in contexts.iter().enumerate() {
        let tag = ctx.tag();
        if !tag.is_none() && layout.generation(tag) == generation {
            if let Some(other) = owners.insert(layout.slot(tag), index) {
                return Err(TestCaseError::fail(format!(
                    "slot {} shared by contexts {other} and {index}",
                    layout.slot(tag)
                )));
            }
        }
    }

    // no processor runs under a slot that was handed to someone else
    for (id, running) in sys.running.iter().enumerate() {
        let Some((slot, root)) = sys.machine.installed(cpu(id)) else {
            continue;
        };
        prop_assert_eq!(root, running.root());
        if let Some(owner) = owners.get(&slot) {
            prop_assert!(Arc::ptr_eq(&contexts[*owner], running));
        }
    }

    Ok(())
}

proptest! {
    #[test]
    fn switches_keep_tags_unique((cpus, generation_bits, contexts, ops) in scenario()) {
        let config = Config {
            generation_bits,
            ..Config::default()
        };
        let mut sys = System::new(cpus, 3, config);
        let contexts: Vec<_> = (0..contexts).map(|_| sys.spawn()).collect();
        let layout = sys.manager.layout().unwrap();

        for op in ops {
            sys.take_events();

            match op {
                Op::Switch { cpu: id, ctx } => {
                    let next = &contexts[ctx];
                    let noop = Arc::ptr_eq(&sys.running[id], next);
                    let stale = next.icache_stale().contains(cpu(id));

                    sys.switch(id, next);

                    // a processor still running its reserved tag across a rollover keeps it
                    if !noop {
                        prop_assert_eq!(
                            layout.generation(next.tag()),
                            sys.manager.generation().unwrap()
                        );
                    }
                    prop_assert!(next.residency().contains(cpu(id)));
                    prop_assert!(next.cache_membership().contains(cpu(id)));

                    let fences = sys
                        .take_events()
                        .into_iter()
                        .filter(|event| *event == Event::FenceI { cpu: cpu(id) })
                        .count();
                    prop_assert_eq!(fences, usize::from(stale && !noop));
                    if !noop {
                        prop_assert!(!next.icache_stale().contains(cpu(id)));
                    }
                }
                Op::MarkStale { cpu: id, ctx } => {
                    let mm = &contexts[ctx];
                    sys.manager.mark_stale(mm, cpu(id));

                    let expected = CpuMask::first(cpus).without(cpu(id));
                    for other in &expected {
                        prop_assert!(mm.icache_stale().contains(other));
                    }
                    prop_assert_eq!(sys.take_events(), [Event::FenceI { cpu: cpu(id) }]);
                }
            }

            check_tags(&sys, &contexts)?;
        }
    }

    #[test]
    fn stale_marks_are_consumed_once(cpus in 2..=4usize, switches in 1..8usize) {
        let mut sys = System::new(cpus, 16, Config::default());
        let [a, b] = [(); 2].map(|()| sys.spawn());
        for id in 0..cpus {
            sys.switch(id, &a);
        }

        sys.manager.mark_stale(&a, cpu(0));
        sys.take_events();

        for _ in 0..switches {
            for id in 1..cpus {
                sys.switch(id, &b);
                sys.switch(id, &a);
            }
        }

        let events = sys.take_events();
        for id in 1..cpus {
            let fences = events
                .iter()
                .filter(|event| **event == Event::FenceI { cpu: cpu(id) })
                .count();
            prop_assert_eq!(fences, 1);
        }
        prop_assert!(a.icache_stale().is_empty());
    }
}
