#![cfg(all(feature = "memory-store", feature = "memory-cache"))]

use futures::executor::block_on;
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenant_gate::{
    BindingOptions, EvaluationContext, Gate, MemoryCache, MemoryStore, PermissionCache,
    PolicyDefinition, PolicyId, PolicyRule, RbacEvaluator, RbacEvaluatorBuilder, RbacResolver,
    RoleDraft, RoleId, Subject, SubjectId, SubjectKind, TenantId, TenantRef,
};

const REPEATS: usize = 5;

fn benchmark_sync<F>(name: &str, iterations: usize, mut op: F)
where
    F: FnMut(),
{
    let mut samples = Vec::with_capacity(REPEATS);

    for _ in 0..REPEATS {
        let start = Instant::now();
        for _ in 0..iterations {
            op();
        }
        samples.push(start.elapsed());
    }

    samples.sort_unstable();
    let median = samples[REPEATS / 2];
    let total_ms = median.as_secs_f64() * 1_000.0;
    let ns_per_op = median.as_secs_f64() * 1_000_000_000.0 / iterations as f64;
    let ops_per_sec = iterations as f64 / median.as_secs_f64();

    println!(
        "{name}: median={total_ms:.3} ms, ns/op={ns_per_op:.1}, ops/s={ops_per_sec:.0} (iters={iterations}, repeats={REPEATS})"
    );
}

fn benchmark_parallel<F>(name: &str, threads: usize, iterations_per_thread: usize, op_factory: F)
where
    F: Fn() -> Box<dyn FnMut() + Send> + Send + Sync + 'static,
{
    let op_factory = Arc::new(op_factory);
    let mut samples = Vec::with_capacity(REPEATS);

    for _ in 0..REPEATS {
        let start = Instant::now();
        let mut joins = Vec::with_capacity(threads);
        for _ in 0..threads {
            let factory = Arc::clone(&op_factory);
            joins.push(std::thread::spawn(move || {
                let mut op = factory();
                for _ in 0..iterations_per_thread {
                    op();
                }
            }));
        }
        for join in joins {
            join.join().expect("thread panicked");
        }
        samples.push(start.elapsed());
    }

    samples.sort_unstable();
    let median = samples[REPEATS / 2];
    let total_ops = threads * iterations_per_thread;
    let total_ms = median.as_secs_f64() * 1_000.0;
    let ns_per_op = median.as_secs_f64() * 1_000_000_000.0 / total_ops as f64;
    let ops_per_sec = total_ops as f64 / median.as_secs_f64();

    println!(
        "{name}: median={total_ms:.3} ms, ns/op={ns_per_op:.1}, ops/s={ops_per_sec:.0} (threads={threads}, total_ops={total_ops}, repeats={REPEATS})"
    );
}

fn ctx(gate: &Gate, tenant: &TenantId, subject: &SubjectId, code: &str) -> EvaluationContext {
    gate.create_context(TenantRef::new(tenant.clone()))
        .subject(Subject::user(subject.clone()))
        .permission(code)
        .build()
}

fn seed_flat<C: PermissionCache>(
    evaluator: &RbacEvaluator<MemoryStore, C>,
) -> (TenantId, SubjectId) {
    let tenant = TenantId::try_from("tenant_perf").unwrap();
    let subject = SubjectId::try_from("subject_perf").unwrap();
    let role = RoleId::try_from("role_reader").unwrap();

    block_on(evaluator.create_role(
        Some(tenant.clone()),
        RoleDraft::new(role.clone(), "role_reader").permission("invoice:read"),
    ))
    .unwrap();
    block_on(evaluator.assign_role(
        tenant.clone(),
        role,
        SubjectKind::User,
        subject.clone(),
        BindingOptions::new(),
    ))
    .unwrap();

    (tenant, subject)
}

fn setup_hierarchy_gate(depth: usize) -> (Gate, TenantId, SubjectId) {
    let evaluator = Arc::new(
        RbacEvaluatorBuilder::new(MemoryStore::new())
            .max_inherit_depth(depth + 2)
            .build(),
    );
    let tenant = TenantId::try_from("tenant_hier_perf").unwrap();
    let subject = SubjectId::try_from("subject_hier_perf").unwrap();

    let tail = RoleId::try_from(format!("role_chain_{depth}").as_str()).unwrap();
    block_on(evaluator.create_role(
        Some(tenant.clone()),
        RoleDraft::new(tail, format!("role_chain_{depth}")).permission("invoice:read"),
    ))
    .unwrap();
    for i in (0..depth).rev() {
        let current = RoleId::try_from(format!("role_chain_{i}").as_str()).unwrap();
        let next = RoleId::try_from(format!("role_chain_{}", i + 1).as_str()).unwrap();
        block_on(evaluator.create_role(
            Some(tenant.clone()),
            RoleDraft::new(current, format!("role_chain_{i}")).inherit(next),
        ))
        .unwrap();
    }
    block_on(evaluator.assign_role(
        tenant.clone(),
        RoleId::try_from("role_chain_0").unwrap(),
        SubjectKind::User,
        subject.clone(),
        BindingOptions::new(),
    ))
    .unwrap();

    let gate = Gate::builder().resolver(RbacResolver::new(evaluator)).build();
    (gate, tenant, subject)
}

#[test]
#[ignore = "manual performance test; run with --ignored --nocapture"]
fn perf_check_permission() {
    let iterations = 200_000;

    let evaluator = Arc::new(RbacEvaluatorBuilder::new(MemoryStore::new()).build());
    let (tenant, subject) = seed_flat(&evaluator);
    let gate = Gate::builder().resolver(RbacResolver::new(evaluator)).build();
    let request = ctx(&gate, &tenant, &subject, "invoice:read");
    benchmark_sync("check_flat_no_cache", iterations, || {
        let result = block_on(gate.check_permission(&request)).unwrap();
        black_box(result);
    });

    let evaluator = Arc::new(
        RbacEvaluatorBuilder::new(MemoryStore::new())
            .cache(MemoryCache::new(8_192).with_ttl(Duration::from_secs(60)))
            .build(),
    );
    let (tenant, subject) = seed_flat(&evaluator);
    let gate = Gate::builder().resolver(RbacResolver::new(evaluator)).build();
    let request = ctx(&gate, &tenant, &subject, "invoice:read");
    let warm = block_on(gate.check_permission(&request)).unwrap();
    assert!(warm.allowed);
    benchmark_sync("check_flat_hot_cache", iterations, || {
        let result = block_on(gate.check_permission(&request)).unwrap();
        black_box(result);
    });

    let policy_gate = Gate::new();
    policy_gate
        .register_policy(
            PolicyDefinition::new(PolicyId::try_from("readers").unwrap())
                .rule(PolicyRule::allow(["invoice:read"])),
        )
        .unwrap();
    let request = ctx(&policy_gate, &tenant, &subject, "invoice:read");
    benchmark_sync("check_policy_only", iterations, || {
        let result = block_on(policy_gate.check_permission(&request)).unwrap();
        black_box(result);
    });

    let (gate, tenant, subject) = setup_hierarchy_gate(8);
    let request = ctx(&gate, &tenant, &subject, "invoice:read");
    benchmark_sync("check_hierarchy_depth8_no_cache", iterations / 4, || {
        let result = block_on(gate.check_permission(&request)).unwrap();
        black_box(result);
    });

    let threads = std::thread::available_parallelism()
        .map(|n| n.get().min(8))
        .unwrap_or(4);
    let iterations_per_thread = 50_000;

    let evaluator = Arc::new(
        RbacEvaluatorBuilder::new(MemoryStore::new())
            .cache(MemoryCache::new(8_192).with_ttl(Duration::from_secs(60)))
            .build(),
    );
    let (tenant, subject) = seed_flat(&evaluator);
    let shared_gate = Arc::new(
        Gate::builder()
            .resolver(RbacResolver::new(evaluator))
            .build(),
    );
    let warm = block_on(
        shared_gate.check_permission(&ctx(&shared_gate, &tenant, &subject, "invoice:read")),
    )
    .unwrap();
    assert!(warm.allowed);

    let gate_for_parallel = Arc::clone(&shared_gate);
    benchmark_parallel(
        "check_flat_hot_cache_parallel",
        threads,
        iterations_per_thread,
        move || {
            let gate = Arc::clone(&gate_for_parallel);
            let request = ctx(&gate, &tenant, &subject, "invoice:read");
            Box::new(move || {
                let result = block_on(gate.check_permission(&request)).unwrap();
                black_box(result);
            })
        },
    );
}
