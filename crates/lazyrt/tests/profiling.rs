#![cfg(feature = "profiler")]

mod common;

use std::sync::Arc;

use common::{add_one, harness};
use lazyrt::profiling;
use lazyrt::shape::fixed;
use lazyrt::{DType, ScheduleExecutor, ScheduleItem};

#[test]
fn executor_reports_cache_compile_and_kernel_timings() {
    profiling::reset();
    let h = harness();
    let src = h.realized("CPU", fixed(&[3]), &[1.0, 2.0, 3.0]);

    for _ in 0..2 {
        let ast = add_one(3);
        let out = common::unrealized("CPU", fixed(&[3]), DType::F32, &ast);
        let mut schedule = vec![ScheduleItem::new(ast, out, vec![Arc::clone(&src)])].into();
        ScheduleExecutor::new(&h.registry)
            .wait(true)
            .run(&mut schedule)
            .expect("run");
    }

    let report = profiling::snapshot();
    assert_eq!(report.compile_count("artifact_cache.compile"), 1);
    assert_eq!(report.cache_count("artifact_cache.miss_disk"), 1);
    let kernel = report
        .backend
        .iter()
        .find(|(name, _)| *name == "kernel_exec")
        .map(|(_, stat)| stat.calls);
    assert_eq!(kernel, Some(2));
}
