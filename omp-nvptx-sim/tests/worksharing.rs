#![allow(clippy::unwrap_used)]

mod common;

use omp_nvptx::{
    device::thread::BlockShape,
    directive::{
        Clause, DirectiveKind, ExecutableDirective, Expr, ExprOp, LoopBounds, Place, ReductionOp,
        ScheduleKind, Stmt, VarId,
    },
    OffloadTarget,
};
use omp_nvptx_sim::LaunchConfig;

use common::{device, region, run};

fn slot(var: u32, index: i64) -> Place {
    Place::element(VarId(var), Expr::Int(index))
}

/// `red[0] += 1; red[1] += i` over `0..100`, reduced with `+`.
fn sum_and_count(kind: DirectiveKind) -> ExecutableDirective {
    let add = |index, value| Stmt::Assign {
        place: slot(0, index),
        value: Expr::binary(ExprOp::Add, Expr::load(slot(0, index)), value),
    };

    ExecutableDirective::new(kind)
        .with_clause(Clause::Reduction {
            op: ReductionOp::Add,
            var: VarId(0),
        })
        .with_bounds(LoopBounds::new(0, 100))
        .with_body(vec![add(0, Expr::Int(1)), add(1, Expr::LoopIndex)])
}

/// `hits[i] += 1` for every `i` in `0..n`.
fn touch_every_index(kind: DirectiveKind, n: i64) -> ExecutableDirective {
    ExecutableDirective::new(kind)
        .with_bounds(LoopBounds::new(0, n))
        .with_body(vec![Stmt::AtomicUpdate {
            op: ReductionOp::Add,
            place: Place::element(VarId(0), Expr::LoopIndex),
            value: Expr::Int(1),
        }])
}

#[test]
fn combined_reduction_is_combined_once_per_team_member() {
    let threads = 64;
    let team = u64::from(BlockShape::new(threads, 32).team_size());
    let reduction = sum_and_count(DirectiveKind::TargetTeamsDistributeParallelFor);

    for grid in [1, 2] {
        let (values, stats, addresses) = run(
            OffloadTarget::Nvptx64,
            device(grid, threads),
            &region(&[2], reduction.clone()),
        );

        assert_eq!(values[0], vec![100, 4950], "grid {grid}");
        for offset in 0..2 {
            assert_eq!(
                stats.atomic_updates(addresses[0] + offset),
                u64::from(grid) * team,
                "grid {grid}"
            );
        }
    }
}

#[test]
fn device_and_host_reductions_agree() {
    let reduction = region(
        &[2],
        sum_and_count(DirectiveKind::TargetTeamsDistributeParallelForSimd),
    );

    let (device_values, ..) = run(OffloadTarget::Nvptx64, device(3, 96), &reduction);

    let host = LaunchConfig::default().set_host_threads(3).unwrap();
    let (host_values, stats, addresses) = run(OffloadTarget::Host, host, &reduction);

    assert_eq!(device_values, host_values);
    assert_eq!(stats.atomic_updates(addresses[0]), 3);
}

#[test]
fn min_and_max_reductions_start_from_their_identities() {
    let nested = ExecutableDirective::new(DirectiveKind::DistributeParallelFor)
        .with_clause(Clause::Reduction {
            op: ReductionOp::Min,
            var: VarId(0),
        })
        .with_clause(Clause::Reduction {
            op: ReductionOp::Max,
            var: VarId(1),
        })
        .with_bounds(LoopBounds::new(10, 50))
        .with_body(vec![
            Stmt::Assign {
                place: slot(0, 0),
                value: Expr::binary(ExprOp::Min, Expr::load(slot(0, 0)), Expr::LoopIndex),
            },
            Stmt::Assign {
                place: slot(1, 0),
                value: Expr::binary(ExprOp::Max, Expr::load(slot(1, 0)), Expr::LoopIndex),
            },
        ]);
    let teams = ExecutableDirective::new(DirectiveKind::Teams)
        .with_body(vec![Stmt::Directive(Box::new(nested))]);
    let target = ExecutableDirective::new(DirectiveKind::Target).with_body(vec![
        Stmt::Assign {
            place: slot(0, 0),
            value: Expr::Int(1000),
        },
        Stmt::Assign {
            place: slot(1, 0),
            value: Expr::Int(-1000),
        },
        Stmt::Directive(Box::new(teams)),
    ]);

    let (values, ..) = run(OffloadTarget::Nvptx64, device(1, 96), &region(&[1, 1], target));
    assert_eq!(values, vec![vec![10], vec![49]]);
}

#[test]
fn distribute_only_reduction_is_combined_by_each_team() {
    let grid = 3;
    let (values, stats, addresses) = run(
        OffloadTarget::Nvptx64,
        device(grid, 64),
        &region(&[2], sum_and_count(DirectiveKind::TargetTeamsDistribute)),
    );

    assert_eq!(values[0], vec![100, 4950]);
    assert_eq!(stats.atomic_updates(addresses[0]), u64::from(grid));
    assert_eq!(stats.invocations_where(common::is_outlined), 0);
}

#[test]
fn every_schedule_covers_each_iteration_once() {
    let schedules = [
        (ScheduleKind::Static, None),
        (ScheduleKind::Static, Some(Expr::Int(1))),
        (ScheduleKind::Static, Some(Expr::Int(4))),
        (ScheduleKind::Dynamic, None),
        (ScheduleKind::Guided, Some(Expr::Int(7))),
        (ScheduleKind::Auto, None),
    ];

    for (kind, chunk) in schedules {
        for threads in [33, 64, 100] {
            let directive = touch_every_index(DirectiveKind::TargetParallelFor, 97)
                .with_clause(Clause::Schedule {
                    kind,
                    chunk: chunk.clone(),
                });

            let (values, ..) = run(
                OffloadTarget::Nvptx64,
                device(1, threads),
                &region(&[97], directive),
            );
            assert_eq!(values[0], vec![1; 97], "{kind:?} {chunk:?} on {threads} threads");
        }
    }
}

#[test]
fn dist_schedule_chunks_cover_the_league() {
    for chunk in [None, Some(Expr::Int(1)), Some(Expr::Int(8)), Some(Expr::Int(500))] {
        let directive =
            touch_every_index(DirectiveKind::TargetTeamsDistributeParallelFor, 100)
                .with_clause(Clause::DistSchedule {
                    chunk: chunk.clone(),
                });

        let (values, ..) = run(
            OffloadTarget::Nvptx64,
            device(3, 64),
            &region(&[100], directive),
        );
        assert_eq!(values[0], vec![1; 100], "{chunk:?}");
    }
}

#[test]
fn empty_iteration_spaces_leave_memory_untouched() {
    let directive = ExecutableDirective::new(DirectiveKind::TargetTeamsDistributeParallelFor)
        .with_bounds(LoopBounds::new(5, 5))
        .with_body(vec![Stmt::Assign {
            place: slot(0, 0),
            value: Expr::Int(1),
        }]);

    let (values, stats, _) = run(
        OffloadTarget::Nvptx64,
        device(2, 64),
        &region(&[1], directive),
    );
    assert_eq!(values[0], vec![0]);
    assert_eq!(stats.invocations_where(common::is_outlined), 0);
}
