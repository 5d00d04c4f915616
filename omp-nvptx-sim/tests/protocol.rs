#![allow(clippy::unwrap_used)]

mod common;

use omp_nvptx::{
    device::thread::BlockShape,
    directive::{
        Clause, DirectiveKind, ExecutableDirective, Expr, ExprOp, Place, ReductionOp, Stmt, VarId,
    },
    runtime::nvptx::dispatch::DISPATCH_SLOT_SYMBOL,
    OffloadTarget,
};
use regex::Regex;

use common::{compile_for, device, is_outlined, kernel_name, region, run};

fn counter() -> Place {
    Place::scalar(VarId(0))
}

fn increment() -> Stmt {
    Stmt::AtomicUpdate {
        op: ReductionOp::Add,
        place: counter(),
        value: Expr::Int(1),
    }
}

fn parallel(body: Vec<Stmt>) -> Stmt {
    Stmt::Directive(Box::new(
        ExecutableDirective::new(DirectiveKind::Parallel).with_body(body),
    ))
}

/// `parallel if(v1[0] != 0)` incrementing the counter.
fn guarded_parallel() -> Stmt {
    Stmt::Directive(Box::new(
        ExecutableDirective::new(DirectiveKind::Parallel)
            .with_clause(Clause::If {
                modifier: None,
                condition: Expr::binary(
                    ExprOp::Ne,
                    Expr::load(Place::scalar(VarId(1))),
                    Expr::Int(0),
                ),
            })
            .with_body(vec![increment()]),
    ))
}

fn target(body: Vec<Stmt>) -> ExecutableDirective {
    ExecutableDirective::new(DirectiveKind::Target).with_body(body)
}

#[test]
fn sequential_parallel_regions_each_run_on_the_whole_team() {
    let threads = 96;
    let team = u64::from(BlockShape::new(threads, 32).team_size());

    for regions in 1..=3 {
        let body = (0..regions).map(|_| parallel(vec![increment()])).collect();
        let (values, stats, _) = run(
            OffloadTarget::Nvptx64,
            device(1, threads),
            &region(&[1], target(body)),
        );

        let regions = u64::try_from(regions).unwrap();
        assert_eq!(values[0], vec![i64::try_from(regions * team).unwrap()]);
        assert_eq!(stats.invocations_where(is_outlined), regions * team);
        assert_eq!(stats.global_stores(DISPATCH_SLOT_SYMBOL, 0), regions);
    }
}

#[test]
fn every_block_runs_its_own_state_machine() {
    let (grid, threads) = (4, 64);
    let team = u64::from(BlockShape::new(threads, 32).team_size());

    let (values, stats, _) = run(
        OffloadTarget::Nvptx64,
        device(grid, threads),
        &region(&[1], target(vec![parallel(vec![increment()])])),
    );

    assert_eq!(values[0], vec![i64::try_from(u64::from(grid) * team).unwrap()]);
    assert_eq!(stats.global_stores(DISPATCH_SLOT_SYMBOL, 0), u64::from(grid));
    assert_eq!(stats.invocations(&kernel_name()), u64::from(grid * threads));
}

#[test]
fn runtime_false_if_runs_serially_without_dispatch() {
    let (values, stats, _) = run(
        OffloadTarget::Nvptx64,
        device(1, 64),
        &region(&[1, 1], target(vec![guarded_parallel()])),
    );

    assert_eq!(values[0], vec![1]);
    assert_eq!(stats.invocations_where(is_outlined), 1);
    assert_eq!(stats.global_stores(DISPATCH_SLOT_SYMBOL, 0), 0);
}

#[test]
fn runtime_true_if_dispatches_to_the_team() {
    let threads = 64;
    let team = BlockShape::new(threads, 32).team_size();

    let enable = Stmt::Assign {
        place: Place::scalar(VarId(1)),
        value: Expr::Int(1),
    };
    let (values, stats, _) = run(
        OffloadTarget::Nvptx64,
        device(1, threads),
        &region(&[1, 1], target(vec![enable, guarded_parallel()])),
    );

    assert_eq!(values[0], vec![i64::from(team)]);
    assert_eq!(stats.invocations_where(is_outlined), u64::from(team));
    assert_eq!(stats.global_stores(DISPATCH_SLOT_SYMBOL, 0), 1);
}

#[test]
fn constant_false_if_is_folded_into_a_serial_call() {
    let serial = Stmt::Directive(Box::new(
        ExecutableDirective::new(DirectiveKind::Parallel)
            .with_clause(Clause::If {
                modifier: Some(omp_nvptx::directive::LeafConstruct::Parallel),
                condition: Expr::Int(0),
            })
            .with_body(vec![increment()]),
    ));

    let (values, stats, _) = run(
        OffloadTarget::Nvptx64,
        device(1, 128),
        &region(&[1], target(vec![serial])),
    );

    assert_eq!(values[0], vec![1]);
    assert_eq!(stats.invocations_where(is_outlined), 1);
    assert_eq!(stats.global_stores(DISPATCH_SLOT_SYMBOL, 0), 0);
}

#[test]
fn nested_parallel_regions_are_serialized_per_thread() {
    let threads = 64;
    let team = BlockShape::new(threads, 32).team_size();

    // every outer member adds the size of its own inner team
    let inner = parallel(vec![Stmt::AtomicUpdate {
        op: ReductionOp::Add,
        place: counter(),
        value: Expr::NumThreads,
    }]);
    let (values, stats, _) = run(
        OffloadTarget::Nvptx64,
        device(1, threads),
        &region(
            &[1],
            ExecutableDirective::new(DirectiveKind::TargetParallel).with_body(vec![inner]),
        ),
    );

    assert_eq!(values[0], vec![i64::from(team)]);
    assert_eq!(stats.invocations_where(is_outlined), 2 * u64::from(team));
    assert_eq!(stats.global_stores(DISPATCH_SLOT_SYMBOL, 0), 1);
}

#[test]
fn idle_lanes_of_the_last_warp_never_run_outlined_code() {
    let threads = 50;
    let shape = BlockShape::new(threads, 32);
    assert_eq!(shape.master_thread_id(), 32);
    let team = u64::from(shape.team_size());

    let (values, stats, _) = run(
        OffloadTarget::Nvptx64,
        device(1, threads),
        &region(
            &[1],
            target(vec![parallel(vec![increment()]), parallel(vec![increment()])]),
        ),
    );

    assert_eq!(values[0], vec![i64::try_from(2 * team).unwrap()]);
    assert_eq!(stats.invocations_where(is_outlined), 2 * team);
    assert_eq!(
        stats.invocations(&format!("{}_worker", kernel_name())),
        u64::from(threads - 1)
    );
}

#[test]
fn block_barriers_are_crossed_in_lockstep() {
    let threads = 96;
    let body = vec![
        parallel(vec![increment()]),
        increment(),
        parallel(vec![increment()]),
        parallel(vec![increment()]),
    ];

    let (_, stats, _) = run(
        OffloadTarget::Nvptx64,
        device(2, threads),
        &region(&[1], target(body)),
    );

    let barriers = stats.block_barriers();
    assert_eq!(barriers.len(), 2 * threads as usize);

    let counts = barriers.values().copied().collect::<Vec<_>>();
    // two per region, plus the final wake that carries termination
    assert!(counts.iter().all(|count| *count == 2 * 3 + 1), "{counts:?}");
}

#[test]
fn team_barrier_synchronizes_master_and_workers() {
    for threads in [64, 96, 50] {
        let team = BlockShape::new(threads, 32).team_size();

        // every member records the counter after everyone incremented it
        let body = vec![
            increment(),
            Stmt::Barrier,
            Stmt::Assign {
                place: Place::element(VarId(1), Expr::ThreadNum),
                value: Expr::load(counter()),
            },
        ];
        let (values, stats, _) = run(
            OffloadTarget::Nvptx64,
            device(1, threads),
            &region(
                &[1, team],
                ExecutableDirective::new(DirectiveKind::TargetParallel).with_body(body),
            ),
        );

        assert_eq!(values[1], vec![i64::from(team); team as usize], "{threads} threads");

        let numbered = stats.numbered_barriers();
        assert_eq!(numbered.len(), team as usize, "{threads} threads");
        assert!(numbered.values().all(|count| *count == 1), "{threads} threads");
    }
}

#[test]
fn serialized_regions_skip_the_team_barrier() {
    let body = vec![Stmt::Directive(Box::new(
        ExecutableDirective::new(DirectiveKind::Parallel)
            .with_clause(Clause::If {
                modifier: None,
                condition: Expr::Int(0),
            })
            .with_body(vec![increment(), Stmt::Barrier]),
    ))];

    let (values, stats, _) = run(
        OffloadTarget::Nvptx64,
        device(1, 64),
        &region(&[1], target(body)),
    );

    assert_eq!(values[0], vec![1]);
    assert!(stats.numbered_barriers().is_empty());
}

#[test]
fn printed_module_shows_the_device_protocol() {
    let compiled = compile_for(
        OffloadTarget::Nvptx64,
        &region(&[1], target(vec![parallel(vec![increment()])])),
    );
    let printed = compiled.module.to_string();

    let slot = Regex::new(&format!(
        r"@{DISPATCH_SLOT_SYMBOL} =[a-z ]* addrspace\(3\) global \[3 x i64\]"
    ))
    .unwrap();
    assert!(slot.is_match(&printed), "{printed}");

    let annotation = Regex::new(r#"!\{ptr @(__omp_offloading_\w+), !"kernel", i32 1\}"#).unwrap();
    let kernels = annotation
        .captures_iter(&printed)
        .map(|captures| captures[1].to_owned())
        .collect::<Vec<_>>();
    assert_eq!(kernels, vec![kernel_name()]);

    assert!(Regex::new(r"call \w+ @__kmpc_kernel_init\(")
        .unwrap()
        .is_match(&printed));
    assert!(Regex::new(r#"section "omp_offloading_entries""#)
        .unwrap()
        .is_match(&printed));
    let worker = Regex::new(&format!(r"define (internal )?void @{}_worker\(\)", kernel_name())).unwrap();
    assert!(worker.is_match(&printed), "{printed}");
}
